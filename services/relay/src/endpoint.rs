//! Endpoint addresses and owned, half-duplex aware socket handles.

use std::ffi::CString;
use std::fmt;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};
use std::str::FromStr;
use std::sync::Mutex;

use socket2::Socket;
use tracing::debug;

use crate::error::RelayError;

/// Host used when an address names only the service.
pub const DEFAULT_HOST: &str = "localhost";

/// A `host:serv` pair as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddr {
    /// Hostname or IP literal.
    pub host: String,
    /// Port number or service name.
    pub serv: String,
}

impl EndpointAddr {
    pub fn new(host: impl Into<String>, serv: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            serv: serv.into(),
        }
    }

    /// Resolve into the list of candidate socket addresses.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, RelayError> {
        let port = self.port()?;

        let candidates: Vec<SocketAddr> = (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| RelayError::Resolution {
                addr: self.clone(),
                detail: e.to_string(),
            })?
            .collect();

        if candidates.is_empty() {
            return Err(RelayError::Resolution {
                addr: self.clone(),
                detail: "no addresses found".to_string(),
            });
        }

        debug!(addr = %self, candidates = ?candidates, "address resolved");
        Ok(candidates)
    }

    fn port(&self) -> Result<u16, RelayError> {
        if let Ok(port) = self.serv.parse::<u16>() {
            return Ok(port);
        }

        lookup_service(&self.serv).ok_or_else(|| RelayError::Resolution {
            addr: self.clone(),
            detail: format!("unknown service '{}'", self.serv),
        })
    }
}

/// Parses `host:serv`, `:serv` or `serv`, splitting on the last colon.
impl FromStr for EndpointAddr {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, serv) = match s.rsplit_once(':') {
            Some(("", serv)) => (DEFAULT_HOST, serv),
            Some((host, serv)) => (host, serv),
            None => (DEFAULT_HOST, s),
        };

        if serv.is_empty() {
            return Err(RelayError::Config(format!(
                "invalid address '{s}': missing service or port"
            )));
        }

        // accept bracketed IPv6 literals such as [::1]:8080
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        Ok(Self::new(host, serv))
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.serv)
    }
}

/// Serializes access to the static entry `getservbyname(3)` returns.
static SERVICES_DB: Mutex<()> = Mutex::new(());

/// Look up a TCP service name in the services database.
fn lookup_service(name: &str) -> Option<u16> {
    let name = CString::new(name).ok()?;

    // a poisoned lock only means another lookup panicked; the entry is
    // rewritten by every call
    let _guard = SERVICES_DB.lock().unwrap_or_else(|e| e.into_inner());

    // SAFETY: both arguments are NUL-terminated, and the lock keeps other
    // lookups from overwriting the entry until the port is copied out.
    let entry = unsafe { libc::getservbyname(name.as_ptr(), c"tcp".as_ptr()) };
    if entry.is_null() {
        return None;
    }

    // s_port holds the port in network byte order
    let port = unsafe { (*entry).s_port };
    Some(u16::from_be(port as u16))
}

/// A connected, non-blocking stream socket with half-duplex bookkeeping.
///
/// Dropping the endpoint shuts down whichever halves are still open and
/// closes the descriptor, exactly once.
#[derive(Debug)]
pub struct Endpoint {
    socket: Socket,
    read_closed: bool,
    write_closed: bool,
}

impl Endpoint {
    /// Wrap an already connected socket. The socket must be non-blocking.
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            read_closed: false,
            write_closed: false,
        }
    }

    /// Adopt a connected std stream, switching it to non-blocking mode.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let socket = Socket::from(stream);
        socket.set_nonblocking(true)?;
        Ok(Self::new(socket))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr().ok().and_then(|a| a.as_socket())
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    /// Shut down the read half. Returns false if it was already closed.
    pub fn shutdown_read(&mut self) -> bool {
        if self.read_closed {
            return false;
        }
        self.half_close(Shutdown::Read);
        self.read_closed = true;
        true
    }

    /// Shut down the write half, sending FIN to the peer. Returns false if
    /// it was already closed.
    pub fn shutdown_write(&mut self) -> bool {
        if self.write_closed {
            return false;
        }
        self.half_close(Shutdown::Write);
        self.write_closed = true;
        true
    }

    fn half_close(&self, how: Shutdown) {
        // the peer may already have reset the connection
        if let Err(e) = self.socket.shutdown(how) {
            debug!(how = ?how, error = %e, "shutdown failed");
        }
    }

    /// One `recv(2)` into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }

    /// One `send(2)` from `buf`, never raising SIGPIPE.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_with_flags(buf, libc::MSG_NOSIGNAL)
    }
}

/// A byte stream whose read and write halves close independently.
pub trait HalfDuplex {
    /// One read into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// One write from `buf`.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close the read half. Returns false if it was already closed.
    fn shutdown_read(&mut self) -> bool;

    /// Close the write half. Returns false if it was already closed.
    fn shutdown_write(&mut self) -> bool;
}

impl HalfDuplex for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Endpoint::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Endpoint::write(self, buf)
    }

    fn shutdown_read(&mut self) -> bool {
        Endpoint::shutdown_read(self)
    }

    fn shutdown_write(&mut self) -> bool {
        Endpoint::shutdown_write(self)
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown_read();
        self.shutdown_write();
        // socket closes when dropped
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use rstest::rstest;

    use super::*;

    fn connected_pair() -> (Endpoint, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (Endpoint::from_stream(accepted).unwrap(), peer)
    }

    #[rstest]
    #[case::host_and_port("example.com:8080", "example.com", "8080")]
    #[case::service_only(":http", DEFAULT_HOST, "http")]
    #[case::bare_port("9000", DEFAULT_HOST, "9000")]
    #[case::ipv6_literal("[::1]:7000", "::1", "7000")]
    #[case::last_colon_wins("::1:7000", "::1", "7000")]
    fn test_parse_address(#[case] input: &str, #[case] host: &str, #[case] serv: &str) {
        let addr: EndpointAddr = input.parse().unwrap();
        assert_eq!(addr, EndpointAddr::new(host, serv));
    }

    #[test]
    fn test_parse_address_requires_service() {
        assert!("example.com:".parse::<EndpointAddr>().is_err());
        assert!("".parse::<EndpointAddr>().is_err());
    }

    #[test]
    fn test_resolve_numeric() {
        let addr = EndpointAddr::new("127.0.0.1", "4242");
        let candidates = addr.resolve().unwrap();
        assert_eq!(candidates, vec!["127.0.0.1:4242".parse().unwrap()]);
    }

    #[test]
    fn test_resolve_unknown_service() {
        let addr = EndpointAddr::new("127.0.0.1", "no-such-service-anywhere");
        let err = addr.resolve().unwrap_err();
        assert_eq!(err.reason_code(), "resolution_failed");
    }

    #[test]
    fn test_service_lookup_from_many_threads() {
        let expected = lookup_service("http");

        let lookups: Vec<_> = (0..8)
            .map(|i| {
                std::thread::spawn(move || {
                    let name = if i % 2 == 0 { "http" } else { "no-such-service-anywhere" };
                    (0..200).map(|_| lookup_service(name)).collect::<Vec<_>>()
                })
            })
            .collect();

        for (i, handle) in lookups.into_iter().enumerate() {
            let want = if i % 2 == 0 { expected } else { None };
            assert!(handle.join().unwrap().iter().all(|port| *port == want));
        }
    }

    #[test]
    fn test_half_close_is_tracked_once() {
        let (mut endpoint, mut peer) = connected_pair();

        assert!(endpoint.shutdown_write());
        assert!(!endpoint.shutdown_write());
        assert!(endpoint.is_write_closed());
        assert!(!endpoint.is_read_closed());

        // peer sees FIN
        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (mut endpoint, _peer) = connected_pair();
        let mut buf = [0u8; 8];

        let err = endpoint.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_drop_closes_both_halves() {
        let (endpoint, mut peer) = connected_pair();
        drop(endpoint);

        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }
}
