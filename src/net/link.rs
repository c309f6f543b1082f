//! A single live transport endpoint and its cancellation token.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::errno;
use crate::net::Handle;
use crate::task::{CancelToken, lock};
use crate::{Error, Result};

#[derive(Debug)]
enum Socket {
    Stream(TcpStream),
    Listener(TcpListener),
}

impl Socket {
    fn into_raw_fd(self) -> RawFd {
        match self {
            Socket::Stream(s) => s.into_raw_fd(),
            Socket::Listener(l) => l.into_raw_fd(),
        }
    }
}

/// Progress of the `connected = true` callback of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Announcing(ThreadId),
    Up,
    Retired,
}

/// Orders the `connected = true` callback of a connection before its
/// `connected = false` callback.
///
/// The receive loop announces; teardown retires. Whichever runs first
/// decides who delivers `true`, and a retire that finds an announcement in
/// flight on another thread waits for it to return.
#[derive(Debug)]
pub(crate) struct Announcement {
    phase: Mutex<Phase>,
    cond: Condvar,
}

impl Announcement {
    fn new(phase: Phase) -> Self {
        Self {
            phase: Mutex::new(phase),
            cond: Condvar::new(),
        }
    }

    /// Claims the `true` callback for the calling thread. Returns `false` if
    /// teardown already retired the connection.
    pub(crate) fn begin(&self) -> bool {
        let mut phase = lock(&self.phase);
        if *phase != Phase::Pending {
            return false;
        }

        *phase = Phase::Announcing(thread::current().id());
        true
    }

    /// Marks the `true` callback as returned.
    pub(crate) fn end(&self) {
        let mut phase = lock(&self.phase);
        if let Phase::Announcing(_) = *phase {
            *phase = Phase::Up;
        }

        self.cond.notify_all();
    }

    /// Retires the connection, waiting out an announcement running on
    /// another thread.
    ///
    /// Returns `false` if `true` was never delivered; the caller then
    /// delivers it before `false`.
    pub(crate) fn retire(&self) -> bool {
        let current = thread::current().id();
        let mut phase = lock(&self.phase);

        loop {
            match *phase {
                Phase::Pending => {
                    *phase = Phase::Retired;
                    return false;
                }
                // Teardown from inside the `true` callback itself.
                Phase::Announcing(id) if id == current => {
                    *phase = Phase::Retired;
                    return true;
                }
                Phase::Announcing(_) => {
                    phase = self
                        .cond
                        .wait(phase)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Phase::Up | Phase::Retired => {
                    *phase = Phase::Retired;
                    return true;
                }
            }
        }
    }
}

/// Owner of one connection's descriptor.
///
/// Writes hold the per-connection lock; loops block on their own duplicate
/// of the descriptor, so neither reading nor accepting ever takes the lock.
/// The descriptor named by the handle is closed exactly once, by
/// [Link::close].
#[derive(Debug)]
pub(crate) struct Link {
    handle: Handle,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    socket: Mutex<Option<Socket>>,
    closed: AtomicBool,
    cancel: CancelToken,
    announce: Announcement,
}

impl Link {
    pub(crate) fn stream(stream: TcpStream) -> Self {
        Self {
            handle: Handle::from_raw(stream.as_raw_fd()),
            local: stream.local_addr().ok(),
            peer: stream.peer_addr().ok(),
            socket: Mutex::new(Some(Socket::Stream(stream))),
            closed: AtomicBool::new(false),
            cancel: CancelToken::new(),
            announce: Announcement::new(Phase::Pending),
        }
    }

    pub(crate) fn listener(listener: TcpListener) -> Self {
        Self {
            handle: Handle::from_raw(listener.as_raw_fd()),
            local: listener.local_addr().ok(),
            peer: None,
            socket: Mutex::new(Some(Socket::Listener(listener))),
            closed: AtomicBool::new(false),
            cancel: CancelToken::new(),
            // Listeners are never announced.
            announce: Announcement::new(Phase::Up),
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        self.handle
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn announcement(&self) -> &Announcement {
        &self.announce
    }

    /// Duplicates the stream descriptor for a receive loop.
    pub(crate) fn reader(&self) -> io::Result<TcpStream> {
        match &*lock(&self.socket) {
            Some(Socket::Stream(s)) => s.try_clone(),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "not a stream")),
        }
    }

    /// Duplicates the listening descriptor for an accept loop.
    pub(crate) fn acceptor(&self) -> io::Result<TcpListener> {
        match &*lock(&self.socket) {
            Some(Socket::Listener(l)) => l.try_clone(),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "not a listener")),
        }
    }

    /// Writes all of `data` to the stream.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] once the link is closed, and
    /// [Error::WriteFailed] if not every byte could be written.
    pub(crate) fn send(&self, data: &[u8]) -> Result<()> {
        match &*lock(&self.socket) {
            Some(Socket::Stream(s)) => {
                let mut s: &TcpStream = s;
                s.write_all(data).map_err(Error::WriteFailed)
            }
            Some(Socket::Listener(_)) => Err(Error::WriteFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write to a listening socket",
            ))),
            None => Err(Error::InvalidHandle(self.handle)),
        }
    }

    /// Cancels the link, shuts the transport down in both directions, then
    /// closes the descriptor.
    ///
    /// The shutdown unblocks a loop sitting in `read()` or `accept()` on its
    /// duplicate, and a writer sitting in `write()`. Only the first call does
    /// anything.
    pub(crate) fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancel.cancel();

        let fd = self.handle.as_raw();
        let shutdown = match unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } {
            // The peer is already gone; nothing is left to shut down.
            -1 if io::Error::last_os_error().raw_os_error() == Some(libc::ENOTCONN) => Ok(()),
            -1 => Err(errno!("failed to shut down socket {}", self.handle)),
            _ => Ok(()),
        };

        let close = match lock(&self.socket).take() {
            Some(socket) => {
                if unsafe { libc::close(socket.into_raw_fd()) } == -1 {
                    Err(errno!("failed to close socket {}", self.handle))
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        };

        shutdown.and(close)
    }
}
