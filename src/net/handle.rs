//! Identifying live transport endpoints.

use std::fmt;
use std::os::fd::RawFd;

/// Opaque identifier of a live transport endpoint: the socket's file
/// descriptor.
///
/// Listeners, outbound clients, and clients admitted by a listener all share
/// one handle space, so a handle names exactly one connection while it is
/// live. Once a connection is torn down the OS may hand the same number to a
/// later connection.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Handle(RawFd);

impl Handle {
    /// Sentinel naming no connection at all.
    pub const NO_SOCKET: Handle = Handle(-1);

    /// Wraps a raw file descriptor.
    pub const fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    /// Returns the underlying file descriptor.
    pub const fn as_raw(self) -> RawFd {
        self.0
    }

    /// Returns `true` for [Handle::NO_SOCKET].
    pub const fn is_none(self) -> bool {
        self.0 == Self::NO_SOCKET.0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::NO_SOCKET
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("NO_SOCKET")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
