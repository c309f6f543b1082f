use std::io;
use std::mem;
use std::process;
use std::ptr;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use log::{LevelFilter, error, info, warn};

use socket_connector::error::Result;
use socket_connector::net::{Connector, Event, Peer};
use socket_connector::{Config, task};

/// Opens one connection, greets every peer, and answers every message.
#[derive(Debug, Parser)]
#[command(version, about)]
#[command(group(ArgGroup::new("role").required(true).args(["client", "server"])))]
struct Args {
    /// Connect to `address:port`.
    #[arg(short, long)]
    client: bool,

    /// Listen on `port`.
    #[arg(short, long)]
    server: bool,

    /// Remote host (client mode).
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Port to listen on or connect to.
    #[arg(long, default_value_t = 1234)]
    port: u16,

    /// Clients the listener admits concurrently.
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// Pause after refusing a client, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    backoff_ms: u64,

    /// Log connection internals as well.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = socket_connector::log::init(level);

    // Blocked before any connection thread exists so every thread inherits
    // the mask and only `sigwait` sees the signal.
    let mask = block_signals().unwrap_or_else(|err| {
        error!("{err}");
        process::exit(1);
    });

    if let Err(err) = run(&args, &mask) {
        error!("{err}");
        process::exit(1);
    }
}

fn run(args: &Args, mask: &libc::sigset_t) -> Result<()> {
    let config = Config {
        clients_per_server: args.clients,
        reject_backoff: Duration::from_millis(args.backoff_ms),
        ..Config::default()
    };

    let connector = Connector::new(config)?;

    if let Some(events) = connector.events() {
        task::spawn("tcp-events", move || {
            for event in events {
                match event {
                    Event::Rejected { server, peer } => {
                        warn!("listener {server} refused {peer}")
                    }
                    other => warn!("{other:?}"),
                }
            }
        })?;
    }

    let on_receive = |peer: &Peer, data: &[u8]| {
        info!(
            "[{}] received {} bytes: {}",
            peer.handle(),
            data.len(),
            String::from_utf8_lossy(data).escape_debug()
        );

        if let Err(err) = peer.send(b"world!") {
            warn!("[{}] failed to reply: {err}", peer.handle());
        }
    };

    let on_change = |peer: &Peer, connected: bool| {
        if !connected {
            info!("[{}] disconnected", peer.handle());
            return;
        }

        match peer.peer_addr() {
            Some(addr) => info!("[{}] connected to {addr}", peer.handle()),
            None => info!("[{}] connected", peer.handle()),
        }

        if let Err(err) = peer.send(b"Hello!") {
            warn!("[{}] failed to greet: {err}", peer.handle());
        }
    };

    let handle = if args.server {
        connector.listen(args.port, on_receive, on_change)?
    } else {
        connector.connect(&args.address, args.port, on_receive, on_change)?
    };

    info!("socket {handle} up, waiting for SIGINT or SIGTERM");

    match wait_for_signal(mask) {
        Ok(signo) => info!("caught signal {signo}, shutting down"),
        Err(err) => error!("{err}"),
    }

    connector.shutdown();

    Ok(())
}

/// Blocks SIGINT and SIGTERM for the calling thread and every thread it
/// spawns afterwards.
fn block_signals() -> io::Result<libc::sigset_t> {
    let mut mask: libc::sigset_t = unsafe { mem::zeroed() };

    unsafe {
        if libc::sigemptyset(&raw mut mask) == -1
            || libc::sigaddset(&raw mut mask, libc::SIGINT) == -1
            || libc::sigaddset(&raw mut mask, libc::SIGTERM) == -1
        {
            return Err(io::Error::last_os_error());
        }

        // `pthread_sigmask` returns the error number instead of setting errno.
        let ret = libc::pthread_sigmask(libc::SIG_BLOCK, &raw const mask, ptr::null_mut());
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
    }

    Ok(mask)
}

/// Waits until one of the signals in `mask` is pending.
fn wait_for_signal(mask: &libc::sigset_t) -> io::Result<libc::c_int> {
    let mut signo: libc::c_int = 0;

    let ret = unsafe { libc::sigwait(mask, &raw mut signo) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }

    Ok(signo)
}
