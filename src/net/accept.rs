//! Accept Loop: one per listener, admitting clients up to the listener's
//! capacity.
//!
//! ```text
//!              +-----------+  accept() ok, room   +-----------+
//!     start -->| Listening |--------------------->| Admitting |--+
//!              +-----------+                      +-----------+  |
//!               ^  |  |      accept() ok, full    +-----------+  |
//!               |  |  +-------------------------->| Rejecting |--+
//!               |  |                              +-----------+  |
//!               |  | accept() failed                             |
//!               |  v                                             |
//!               | Faulted                                        |
//!               +------------------------------------------------+
//! ```
//!
//! The loop ends quietly once its listener is cancelled.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::process;
use std::sync::Arc;

use log::{error, info, warn};

use crate::Error;
use crate::config::FaultPolicy;
use crate::net::connector::Shared;
use crate::net::event::Event;
use crate::net::link::Link;
use crate::net::receive;
use crate::task::{self, lock};

/// Whether the loop should keep accepting.
enum Flow {
    Continue,
    Stop,
}

pub(crate) fn run(shared: Arc<Shared>, server: Arc<Link>, listener: TcpListener) {
    loop {
        if server.is_cancelled() {
            break;
        }

        let (stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(_) if server.is_cancelled() => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                fault(&shared, &server, err);
                break;
            }
        };

        if server.is_cancelled() {
            break;
        }

        if let Flow::Stop = admit(&shared, &server, stream, peer) {
            break;
        }
    }
}

fn admit(shared: &Arc<Shared>, server: &Arc<Link>, stream: TcpStream, peer: SocketAddr) -> Flow {
    let reserved = lock(&shared.registry).reserve_client(server);

    let location = match reserved {
        Ok(Some(location)) => location,
        Ok(None) => return reject(shared, server, stream, peer),
        // The listener is being torn down; `stream` is dropped and closed.
        Err(_) => return Flow::Stop,
    };

    let link = Arc::new(Link::stream(stream));
    let handle = link.handle();

    let reader = match link.reader() {
        Ok(reader) => reader,
        Err(err) => {
            lock(&shared.registry).remove(location);
            let _ = link.close();

            error!("failed to service client {handle} from {peer}: {err}");
            shared.events.emit(Event::AdmissionFailed {
                server: server.handle(),
                error: Error::SocketCreateFailed(err),
            });

            return Flow::Continue;
        }
    };

    let callbacks = {
        let mut registry = lock(&shared.registry);
        if !registry.fill_client(location, Arc::clone(&link)) {
            drop(registry);
            let _ = link.close();
            return Flow::Stop;
        }

        registry.callbacks(location)
    };

    let Some(callbacks) = callbacks else {
        shared.abandon(location, &link);
        return Flow::Stop;
    };
    shared.opened();

    let looped = Arc::clone(&link);
    let task = task::spawn("tcp-recv", {
        let shared = Arc::clone(shared);
        move || receive::run(shared, looped, reader, callbacks)
    });

    match task {
        Ok(task) => shared.track(task),
        Err(err) => {
            shared.abandon(location, &link);

            error!("failed to start receive task for client {handle}: {err}");
            shared.events.emit(Event::AdmissionFailed {
                server: server.handle(),
                error: err,
            });

            return Flow::Continue;
        }
    }

    info!(
        "admitted client {handle} from {peer} on listener {}",
        server.handle()
    );

    Flow::Continue
}

/// Refuses a client at capacity, then backs off.
fn reject(shared: &Shared, server: &Link, stream: TcpStream, peer: SocketAddr) -> Flow {
    let _ = stream.shutdown(Shutdown::Both);
    drop(stream);

    warn!(
        "listener {} at capacity ({} clients), rejected {peer}",
        server.handle(),
        shared.config.clients_per_server
    );
    shared.events.emit(Event::Rejected {
        server: server.handle(),
        peer,
    });

    if server.cancel_token().sleep(shared.config.reject_backoff) {
        Flow::Stop
    } else {
        Flow::Continue
    }
}

/// Applies the configured [FaultPolicy] to a failed `accept()`.
fn fault(shared: &Shared, server: &Arc<Link>, err: io::Error) {
    let handle = server.handle();
    let error = Error::AcceptFailed(err);

    match shared.config.fault_policy {
        FaultPolicy::Exit => {
            error!("listener {handle}: {error}, terminating");
            process::exit(1);
        }
        FaultPolicy::Report => {
            error!("listener {handle}: {error}, closing listener");

            if let Err(err) = shared.teardown_link(server) {
                warn!("listener {handle}: {err}");
            }

            shared.events.emit(Event::ListenerFaulted {
                server: handle,
                error,
            });
        }
    }
}
