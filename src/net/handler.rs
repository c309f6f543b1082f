//! Application callbacks invoked by connection loops.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::Result;
use crate::net::Handle;
use crate::net::link::Link;

/// The connection a callback is about.
///
/// Cloning a `Peer` is cheap; it stays usable after the callback returns,
/// but sends fail with [Error::InvalidHandle](crate::Error::InvalidHandle)
/// once the connection is torn down.
#[derive(Clone)]
pub struct Peer {
    link: Arc<Link>,
}

impl Peer {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Handle of the connection.
    pub fn handle(&self) -> Handle {
        self.link.handle()
    }

    /// Address of the remote end, if the connection is a stream.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.peer_addr()
    }

    /// Writes all of `data` to the connection.
    ///
    /// # Errors
    ///
    /// See [Connector::send](crate::net::Connector::send).
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.link.send(data)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("handle", &self.handle())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

/// Called once per successful read, on the connection's own thread.
///
/// A slow implementation only delays later reads of the same connection.
pub trait OnReceive: Send + Sync {
    /// `data` holds exactly the bytes of one read.
    fn on_receive(&self, peer: &Peer, data: &[u8]);
}

/// Called once when a connection comes up and once when it is torn down.
///
/// The teardown call happens before the transport is closed, so `peer` can
/// still be used to look up state keyed by its handle.
pub trait OnConnectionChange: Send + Sync {
    /// `connected` is `true` on admission or establishment, `false` on
    /// teardown.
    fn on_connection_change(&self, peer: &Peer, connected: bool);
}

impl<F> OnReceive for F
where
    F: Fn(&Peer, &[u8]) + Send + Sync,
{
    fn on_receive(&self, peer: &Peer, data: &[u8]) {
        self(peer, data)
    }
}

impl<F> OnConnectionChange for F
where
    F: Fn(&Peer, bool) + Send + Sync,
{
    fn on_connection_change(&self, peer: &Peer, connected: bool) {
        self(peer, connected)
    }
}

/// The pair of callbacks registered with a connection. A listener passes its
/// own pair to every client it admits.
#[derive(Clone)]
pub(crate) struct Callbacks {
    pub(crate) receive: Arc<dyn OnReceive>,
    pub(crate) change: Arc<dyn OnConnectionChange>,
}

impl Callbacks {
    pub(crate) fn new<R, C>(receive: R, change: C) -> Self
    where
        R: OnReceive + 'static,
        C: OnConnectionChange + 'static,
    {
        Self {
            receive: Arc::new(receive),
            change: Arc::new(change),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}
