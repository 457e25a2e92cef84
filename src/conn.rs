use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

/// Source of probe connections for one backend.
///
/// The poller holds one shared handle per target; cloning the `Arc` takes a
/// reference and dropping it releases the pool. A host proxy can substitute
/// its own pooled implementation.
pub trait ConnectionPool: Send + Sync {
    /// Opens a connected socket, spending at most `budget` wall-clock time.
    fn open(&self, budget: Duration) -> io::Result<TcpStream>;
}

/// Default pool: dials the backend's IPv4 and IPv6 candidates directly,
/// IPv4 first, splitting the budget across the attempts.
#[derive(Debug)]
pub struct TcpDialer {
    v4: Option<SocketAddr>,
    v6: Option<SocketAddr>,
}

impl TcpDialer {
    pub fn new(v4: Option<SocketAddr>, v6: Option<SocketAddr>) -> Self {
        if let Some(a) = v4 {
            assert!(a.is_ipv4(), "v4 candidate must be an IPv4 address");
        }
        if let Some(a) = v6 {
            assert!(a.is_ipv6(), "v6 candidate must be an IPv6 address");
        }
        Self { v4, v6 }
    }

    /// Dialer for a single address, filed under its family.
    pub fn to(addr: SocketAddr) -> Self {
        if addr.is_ipv4() {
            Self::new(Some(addr), None)
        } else {
            Self::new(None, Some(addr))
        }
    }
}

impl ConnectionPool for TcpDialer {
    fn open(&self, budget: Duration) -> io::Result<TcpStream> {
        let deadline = Instant::now() + budget;
        let mut last_err = None;
        for addr in [self.v4, self.v6].iter().flatten() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match TcpStream::connect_timeout(addr, remaining) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to probe")
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = TcpDialer::to(addr);
        let stream = dialer.open(Duration::from_secs(1)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[test]
    fn test_dialer_without_addresses_errors() {
        let dialer = TcpDialer::new(None, None);
        let err = dialer.open(Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }

    #[test]
    fn test_dialer_reports_connect_failure() {
        // Bind then drop to get a port that refuses connections.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let dialer = TcpDialer::to(addr);
        assert!(dialer.open(Duration::from_millis(500)).is_err());
    }
}
