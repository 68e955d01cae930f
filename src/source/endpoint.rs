//! Bound datagram descriptors owned by a base

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use nix::errno::Errno;
use parking_lot::{RwLock, RwLockReadGuard};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

/// Sizes at or below this are not worth asking the OS for
const SOCKET_BUFFER_FLOOR: usize = 4096;

/// Above this, shrink requests by 1 MiB at a time instead of 2 KiB
const SOCKET_BUFFER_BIG_STEP_ABOVE: usize = 1024 * 1024;

/// A bound datagram socket
#[derive(Debug)]
pub(crate) enum Endpoint {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

impl Endpoint {
    /// Receive one datagram; the sender is `None` for UNIX sockets
    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<IpAddr>)> {
        match self {
            Endpoint::Udp(sock) => sock
                .recv_from(buf)
                .map(|(len, peer)| (len, Some(peer.ip()))),
            Endpoint::Unix(sock) => sock.recv_from(buf).map(|(len, _)| (len, None)),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Udp(sock) => sock.local_addr().ok(),
            Endpoint::Unix(_) => None,
        }
    }

    /// Ask for an `SO_RCVBUF` of `size` bytes, settling for less when the
    /// OS reports `ENOBUFS`
    ///
    /// Returns the size that was accepted, or 0 if nothing above the floor
    /// was.
    pub(crate) fn grow_recv_buffer(&self, size: usize) -> io::Result<usize> {
        let sock = SockRef::from(self);
        let mut n = size;

        while n > SOCKET_BUFFER_FLOOR {
            match sock.set_recv_buffer_size(n) {
                Ok(()) => return Ok(n),
                Err(e) if e.raw_os_error() == Some(Errno::ENOBUFS as i32) => {
                    if n > SOCKET_BUFFER_BIG_STEP_ABOVE {
                        n -= SOCKET_BUFFER_BIG_STEP_ABOVE;
                    } else {
                        n -= 2048;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(0)
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Endpoint::Udp(sock) => sock.as_fd(),
            Endpoint::Unix(sock) => sock.as_fd(),
        }
    }
}

/// A slot holding an endpoint until it is closed
///
/// The reader thread and socket-buffer balancing share read access; closing
/// takes the write lock and drops the socket.
#[derive(Debug)]
pub(crate) struct Descriptor {
    endpoint: RwLock<Option<Endpoint>>,
}

impl Descriptor {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint: RwLock::new(Some(endpoint)),
        }
    }

    pub(crate) fn endpoint(&self) -> RwLockReadGuard<'_, Option<Endpoint>> {
        self.endpoint.read()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.endpoint.read().is_some()
    }

    /// Close the endpoint; returns true if this call closed it
    pub(crate) fn close(&self) -> bool {
        self.endpoint.write().take().is_some()
    }
}

/// Bind a non-blocking UDP socket to `addr`
///
/// IPv6 sockets are v6-only so the same port can also be bound on IPv4.
pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Bind a non-blocking UNIX datagram socket at `path`, replacing any
/// existing file there
pub(crate) fn bind_unix(path: &Path) -> io::Result<UnixDatagram> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let socket = UnixDatagram::bind(path)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
