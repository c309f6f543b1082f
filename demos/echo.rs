//! An echo server: every client gets back exactly what it sent.
//!
//! Run it with:
//!
//!     cargo r --example echo
//!
//! And then in another terminal run:
//!
//!     nc 127.0.0.1 6142

use std::thread;

use log::{LevelFilter, info};
use socket_connector::net::{Connector, Peer};
use socket_connector::{Config, Result};

fn main() -> Result<()> {
    let _ = socket_connector::log::init(LevelFilter::Info);

    let connector = Connector::new(Config {
        max_clients: 0,
        clients_per_server: 4,
        ..Config::default()
    })?;

    connector.listen(
        6142,
        |peer: &Peer, data: &[u8]| {
            info!(
                "[{}] read {} bytes from peer: {}",
                peer.handle(),
                data.len(),
                String::from_utf8_lossy(data).escape_debug()
            );

            if peer.send(data).is_ok() {
                info!("[{}] wrote {} bytes to the peer", peer.handle(), data.len());
            }
        },
        |peer: &Peer, connected: bool| {
            if connected {
                info!("[{}] accepted new connection", peer.handle());
            }
        },
    )?;

    loop {
        thread::park();
    }
}
