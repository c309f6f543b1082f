use std::{io, result};

use thiserror::Error;

use crate::net::Handle;

/// Creates an [`io::Error`] with a custom message prefixed to the current
/// `errno` value.
///
/// [`io::Error`]: std::io::Error
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        let msg = format!("{prefix}: {errno}");
        ::std::io::Error::new(errno.kind(), msg)
    }};
}
pub(crate) use errno;

/// A convenience wrapper around `Result` for [crate::Error].
pub type Result<T> = result::Result<T, Error>;

/// Represents errors that can occur while managing TCP connections.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Every registry slot (or every admission slot of a listener) is taken.
    #[error("no space for connection (registry capacity reached)")]
    NoSpaceForConnection,
    /// The transport endpoint could not be created.
    #[error("failed to create socket: {0}")]
    SocketCreateFailed(#[source] io::Error),
    /// The listening endpoint could not be bound, even after enabling address
    /// reuse.
    #[error("failed to bind port {port}: {source}")]
    BindFailed {
        /// The port that was requested.
        port: u16,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
    /// The bound endpoint could not start listening.
    #[error("failed to listen: {0}")]
    ListenFailed(#[source] io::Error),
    /// The outbound connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The remote address, as given by the caller.
        addr: String,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A listener failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    AcceptFailed(#[source] io::Error),
    /// A read failed other than by orderly close.
    #[error("failed to receive data: {0}")]
    ReceiveFailed(#[source] io::Error),
    /// Not every byte of a payload could be written.
    #[error("failed to write data: {0}")]
    WriteFailed(#[source] io::Error),
    /// Shutting down or closing the transport failed. The connection is
    /// released regardless.
    #[error("failed to disconnect: {0}")]
    DisconnectFailed(#[source] io::Error),
    /// No live connection is registered under the handle.
    #[error("invalid handle: {0}")]
    InvalidHandle(Handle),
    /// A background task could not be started.
    #[error("failed to create task: {0}")]
    TaskCreateFailed(#[source] io::Error),
    /// A caller-supplied parameter (address, configuration value) is invalid.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}
