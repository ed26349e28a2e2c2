use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::info;

use crate::error::{Result, TransportError};

/// A listening TCP socket whose accepts run on the worker pool.
#[derive(Debug)]
pub struct TcpEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpEndpoint {
    /// Bind and listen on `addr`. Port 0 picks a free port.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let listener = TcpListener::bind(&addr).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;

        info!(%local_addr, "listening on tcp");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address the endpoint is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Create an unconnected stream socket of the right family for `addr`.
    ///
    /// The caller connects it, usually through a pool `Connect` request.
    pub fn socket(addr: &SocketAddr) -> Result<OwnedFd> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        // SAFETY: plain socket creation with constant arguments.
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd == -1 {
            return Err(TransportError::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: `fd` was just returned by socket() and is owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl AsRawFd for TcpEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_reports_ephemeral_port() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").unwrap();
        assert!(endpoint.local_addr().ip().is_loopback());
        assert_ne!(endpoint.local_addr().port(), 0);
        assert!(endpoint.as_raw_fd() >= 0);
    }

    #[test]
    fn bind_conflict_is_reported() {
        let first = TcpEndpoint::bind("127.0.0.1:0").unwrap();
        let taken = first.local_addr().to_string();

        let err = TcpEndpoint::bind(taken.as_str()).unwrap_err();
        assert!(matches!(err, TransportError::Bind { ref addr, .. } if *addr == taken));
    }

    #[test]
    fn socket_matches_address_family() {
        let v4: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let fd = TcpEndpoint::socket(&v4).unwrap();
        assert!(fd.as_raw_fd() >= 0);
    }
}
