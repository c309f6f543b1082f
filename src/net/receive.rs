//! Receive Loop: one per connection, delivering every read to the
//! application in order.

use std::io::{self, Read};
use std::net::TcpStream;
use std::sync::Arc;

use log::{debug, error};

use crate::Error;
use crate::net::connector::Shared;
use crate::net::event::Event;
use crate::net::handler::{Callbacks, Peer};
use crate::net::link::Link;

/// Announces the connection, then reads until orderly close, a read error,
/// or cancellation.
///
/// The buffer is owned by this loop and reused for every read. Orderly close
/// and read errors tear the connection down; cancellation means someone else
/// already did.
pub(crate) fn run(
    shared: Arc<Shared>,
    link: Arc<Link>,
    mut reader: TcpStream,
    callbacks: Callbacks,
) {
    let peer = Peer::new(Arc::clone(&link));
    let handle = link.handle();
    let mut buf = vec![0u8; shared.config.buffer_size];

    if !link.announcement().begin() {
        return;
    }
    callbacks.change.on_connection_change(&peer, true);
    link.announcement().end();

    loop {
        if link.is_cancelled() {
            return;
        }

        match reader.read(&mut buf) {
            Ok(0) => {
                if link.is_cancelled() {
                    return;
                }

                debug!("socket {handle} closed by peer");
                teardown(&shared, &link);
                return;
            }
            Ok(nbytes) => {
                if link.is_cancelled() {
                    return;
                }

                debug!("read {nbytes} bytes from socket {handle}");
                callbacks.receive.on_receive(&peer, &buf[..nbytes]);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if link.is_cancelled() {
                    return;
                }

                error!("failed to read from socket {handle}: {err}");
                teardown(&shared, &link);
                shared.events.emit(Event::ReceiveFailed {
                    handle,
                    error: Error::ReceiveFailed(err),
                });
                return;
            }
        }
    }
}

fn teardown(shared: &Shared, link: &Arc<Link>) {
    match shared.teardown_link(link) {
        Ok(()) => {}
        // Torn down concurrently; nothing left to do.
        Err(Error::InvalidHandle(_)) => {}
        Err(err) => error!("{err}"),
    }
}
