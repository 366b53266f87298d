//! UDP socket wrapper for Coala
//!
//! The socket is configured through socket2 and then driven as a blocking
//! std socket with a read timeout, so a receive loop wakes up regularly to
//! check for shutdown.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;

/// Default read timeout for blocking receives
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

impl SocketError {
    /// The call returned because the read timeout elapsed
    pub fn is_timeout(&self) -> bool {
        match self {
            SocketError::Io(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
            SocketError::InvalidAddress => false,
        }
    }
}

/// Datagram transport used by the engine's drivers
pub trait DatagramSocket: Send + Sync {
    /// Send one datagram
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError>;

    /// Receive one datagram, returning its length and source
    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError>;

    /// Address the socket is bound to
    fn local_addr(&self) -> Result<SocketAddr, SocketError>;
}

/// Coala UDP socket
pub struct CoalaSocket {
    inner: UdpSocket,
}

impl CoalaSocket {
    /// Create a socket bound to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(DEFAULT_READ_TIMEOUT))?;

        Ok(CoalaSocket {
            inner: socket.into(),
        })
    }

    /// Change how long a receive blocks before returning a timeout
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<(), SocketError> {
        self.inner.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// Allow sending to broadcast addresses
    pub fn set_broadcast(&self, enabled: bool) -> Result<(), SocketError> {
        self.inner.set_broadcast(enabled)?;
        Ok(())
    }

    /// Set the send buffer size
    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_send_buffer_size(size)?;
        Ok(())
    }

    /// Set the receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the receive buffer size
    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).recv_buffer_size()?)
    }

    /// Try to clone the socket
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(CoalaSocket {
            inner: self.inner.try_clone()?,
        })
    }
}

impl DatagramSocket for CoalaSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, target)?)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.inner.recv_from(buf)?)
    }

    fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }
}
