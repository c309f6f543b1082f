//! Creation of IPv4 stream sockets through the raw socket API.
//!
//! `std::net` hides the steps this crate has to control: the listen backlog
//! is tied to the admission capacity, and address reuse is only enabled as a
//! retry after the first bind fails with `EADDRINUSE`.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::{io, mem};

use log::warn;

use crate::error::errno;
use crate::{Error, Result};

/// Creates a blocking IPv4 stream socket.
fn stream_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd == -1 {
        return Err(Error::SocketCreateFailed(errno!(
            "failed to create stream socket"
        )));
    }

    // SAFETY: `fd` was just returned by `socket()` and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn bind(fd: &OwnedFd, addr: SocketAddrV4) -> io::Result<()> {
    let sin = sockaddr(addr);

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &raw const sin as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(errno!("failed to bind {addr}"));
    }

    Ok(())
}

fn set_reuse_addr(fd: &OwnedFd) -> io::Result<()> {
    let enable: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &raw const enable as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(errno!("failed to enable SO_REUSEADDR"));
    }

    Ok(())
}

/// Opens a listener on `port` on all local interfaces, queueing at most
/// `backlog` pending connections.
///
/// If the port is already bound, address reuse is enabled and the bind is
/// retried once.
///
/// # Errors
///
/// Returns [Error::SocketCreateFailed], [Error::BindFailed] or
/// [Error::ListenFailed]. The socket is closed before returning.
pub(crate) fn listen(port: u16, backlog: usize) -> Result<TcpListener> {
    let fd = stream_socket()?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    if let Err(err) = bind(&fd, addr) {
        if err.kind() != io::ErrorKind::AddrInUse {
            return Err(Error::BindFailed { port, source: err });
        }

        warn!("port {port} in use, retrying with address reuse");

        set_reuse_addr(&fd).map_err(|source| Error::BindFailed { port, source })?;
        bind(&fd, addr).map_err(|source| Error::BindFailed { port, source })?;
    }

    let backlog = libc::c_int::try_from(backlog).unwrap_or(libc::c_int::MAX);
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } == -1 {
        return Err(Error::ListenFailed(errno!("failed to listen on port {port}")));
    }

    Ok(TcpListener::from(fd))
}

/// Opens a blocking connection to `addr`.
///
/// # Errors
///
/// Returns [Error::SocketCreateFailed] or [Error::ConnectFailed]. The socket
/// is closed before returning.
pub(crate) fn connect(addr: SocketAddrV4) -> Result<TcpStream> {
    let fd = stream_socket()?;
    let sin = sockaddr(addr);

    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &raw const sin as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(Error::ConnectFailed {
            addr: addr.to_string(),
            source: errno!("failed to connect"),
        });
    }

    Ok(TcpStream::from(fd))
}
