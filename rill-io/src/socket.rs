//! UDP socket wrapper for rill tunnels
//!
//! Builds sockets through socket2 so tunnel buffer sizes can be tuned, then
//! hands out a plain blocking `std::net::UdpSocket` with a read timeout so
//! reader threads can observe shutdown.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// How long a blocking receive may park before rechecking shutdown.
const RECV_POLL: Duration = Duration::from_millis(500);

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid socket address")]
    InvalidAddress,
}

/// Tunnel socket
///
/// A bound, blocking UDP socket with a bounded receive timeout.
pub struct TunnelSocket {
    inner: UdpSocket,
}

impl TunnelSocket {
    /// Bind a new tunnel socket to the given address.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        let inner: UdpSocket = socket.into();
        inner.set_read_timeout(Some(RECV_POLL))?;

        Ok(TunnelSocket { inner })
    }

    /// Set the send buffer size.
    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_send_buffer_size(size)?;
        Ok(())
    }

    /// Set the receive buffer size.
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the send buffer size.
    pub fn send_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).send_buffer_size()?)
    }

    /// Get the receive buffer size.
    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).recv_buffer_size()?)
    }

    /// Get the local address this socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    /// Send one datagram to the given address.
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    /// Receive one datagram, blocking up to the receive poll interval.
    ///
    /// Returns `None` when the timeout elapsed without data.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, addr))),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(SocketError::Io(e)),
        }
    }
}
