//! Connection establishment over non-blocking sockets.
//!
//! Both directions of setup block only inside [`signal::wait`]:
//! - [`listen_and_accept`] binds the first usable candidate, waits for
//!   readability and accepts a single peer
//! - [`connect`] issues a non-blocking connect per candidate, waits for
//!   writability and checks `SO_ERROR`, retrying the whole cycle a few times
//!
//! A caught termination signal aborts either one with
//! [`RelayError::Interrupted`].

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::time::Duration;

use nix::poll::{PollFd, PollFlags};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointAddr};
use crate::error::RelayError;
use crate::signal::{self, CancelToken, WaitError};

/// Pending connections queued on the passive socket.
pub const LISTEN_BACKLOG: i32 = 1;

/// Connect attempts before giving up.
pub const CONNECT_TRIES: u32 = 3;

/// Pause between connect attempts.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Optional kernel buffer sizes applied to every socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketTuning {
    /// `SO_SNDBUF` in bytes.
    pub send_buffer: Option<usize>,
    /// `SO_RCVBUF` in bytes.
    pub recv_buffer: Option<usize>,
}

impl SocketTuning {
    fn apply(&self, socket: &Socket) -> io::Result<()> {
        if let Some(size) = self.send_buffer {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }
}

/// How often and how patiently [`connect_with`] retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub tries: u32,
    pub interval: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            tries: CONNECT_TRIES,
            interval: CONNECT_RETRY_INTERVAL,
        }
    }
}

fn stream_socket(candidate: &SocketAddr, tuning: &SocketTuning) -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::for_address(*candidate),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_nonblocking(true)?;
    tuning.apply(&socket)?;
    Ok(socket)
}

fn wait_for(socket: &Socket, events: PollFlags, cancel: &CancelToken) -> Result<(), WaitError> {
    let mut fds = [PollFd::new(socket.as_fd(), events)];
    signal::wait(&mut fds, None, cancel)?;
    Ok(())
}

fn no_candidate(addr: &EndpointAddr, last_error: Option<io::Error>) -> RelayError {
    RelayError::SocketSetup {
        addr: addr.clone(),
        source: last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no usable address")
        }),
    }
}

/// A passive socket waiting for exactly one peer.
#[derive(Debug)]
pub struct Listener {
    addr: EndpointAddr,
    socket: Socket,
}

impl Listener {
    /// Bind and listen on the first candidate of `addr` that accepts it.
    pub fn bind(addr: &EndpointAddr, tuning: &SocketTuning) -> Result<Self, RelayError> {
        let mut last_error = None;

        for candidate in addr.resolve()? {
            match Self::bind_candidate(&candidate, tuning) {
                Ok(socket) => {
                    info!(addr = %addr, local = %candidate, "listening");
                    return Ok(Self {
                        addr: addr.clone(),
                        socket,
                    });
                }
                Err(e) => {
                    debug!(candidate = %candidate, error = %e, "listen candidate failed");
                    last_error = Some(e);
                }
            }
        }

        Err(no_candidate(addr, last_error))
    }

    fn bind_candidate(candidate: &SocketAddr, tuning: &SocketTuning) -> io::Result<Socket> {
        let socket = stream_socket(candidate, tuning)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(*candidate))?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket)
    }

    /// The bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("listener is not bound to an IP address"))
    }

    /// Wait for one peer and accept it.
    ///
    /// The passive socket is consumed and closed on every path.
    pub fn accept(self, cancel: &CancelToken) -> Result<Endpoint, RelayError> {
        let setup_error = |source: io::Error| RelayError::SocketSetup {
            addr: self.addr.clone(),
            source,
        };

        loop {
            wait_for(&self.socket, PollFlags::POLLIN, cancel)
                .map_err(|e| e.into_relay(setup_error))?;

            let accepted = signal::retry_eintr(cancel, || self.socket.accept());
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if e.is_would_block() => continue,
                // peer reset before we got to it
                Err(WaitError::Io(e)) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e.into_relay(setup_error)),
            };

            socket.set_nonblocking(true).map_err(setup_error)?;

            let peer = peer.as_socket();
            info!(addr = %self.addr, peer = ?peer, "connection accepted");
            return Ok(Endpoint::new(socket));
        }
    }
}

/// Listen on `addr` and accept a single peer.
pub fn listen_and_accept(
    addr: &EndpointAddr,
    tuning: &SocketTuning,
    cancel: &CancelToken,
) -> Result<Endpoint, RelayError> {
    Listener::bind(addr, tuning)?.accept(cancel)
}

/// Connect to `addr` with the default retry policy.
pub fn connect(
    addr: &EndpointAddr,
    tuning: &SocketTuning,
    cancel: &CancelToken,
) -> Result<Endpoint, RelayError> {
    connect_with(addr, tuning, ConnectPolicy::default(), cancel)
}

/// Connect to `addr`, retrying the resolve+connect cycle per `policy`.
///
/// Resolution failures and interruption end the attempt immediately.
pub fn connect_with(
    addr: &EndpointAddr,
    tuning: &SocketTuning,
    policy: ConnectPolicy,
    cancel: &CancelToken,
) -> Result<Endpoint, RelayError> {
    let mut attempt = 1;

    loop {
        match connect_once(addr, tuning, cancel) {
            Ok(endpoint) => return Ok(endpoint),
            Err(err @ (RelayError::Interrupted(_) | RelayError::Resolution { .. })) => {
                return Err(err)
            }
            Err(err) if attempt >= policy.tries => return Err(err),
            Err(err) => {
                warn!(
                    addr = %addr,
                    attempt,
                    tries = policy.tries,
                    error = %err,
                    "connect failed, retrying"
                );
                signal::sleep(policy.interval, cancel).map_err(|e| {
                    e.into_relay(|source| RelayError::SocketSetup {
                        addr: addr.clone(),
                        source,
                    })
                })?;
                attempt += 1;
            }
        }
    }
}

fn connect_once(
    addr: &EndpointAddr,
    tuning: &SocketTuning,
    cancel: &CancelToken,
) -> Result<Endpoint, RelayError> {
    let mut last_error = None;

    for candidate in addr.resolve()? {
        match connect_candidate(&candidate, tuning, cancel) {
            Ok(socket) => {
                info!(addr = %addr, peer = %candidate, "connected");
                return Ok(Endpoint::new(socket));
            }
            Err(WaitError::Interrupted(signal)) => return Err(RelayError::Interrupted(signal)),
            Err(WaitError::Io(e)) => {
                debug!(candidate = %candidate, error = %e, "connect candidate failed");
                last_error = Some(e);
            }
        }
    }

    Err(no_candidate(addr, last_error))
}

fn connect_candidate(
    candidate: &SocketAddr,
    tuning: &SocketTuning,
    cancel: &CancelToken,
) -> Result<Socket, WaitError> {
    let socket = stream_socket(candidate, tuning)?;

    match socket.connect(&SockAddr::from(*candidate)) {
        Ok(()) => return Ok(socket),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        // the connect keeps going in the background
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
            if let Some(signal) = cancel.signal() {
                return Err(WaitError::Interrupted(signal));
            }
        }
        Err(e) => return Err(e.into()),
    }

    wait_for(&socket, PollFlags::POLLOUT, cancel)?;

    match socket.take_error()? {
        None => Ok(socket),
        Some(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Instant;

    use nix::sys::signal::Signal;

    use super::*;

    fn loopback(port: u16) -> EndpointAddr {
        EndpointAddr::new("127.0.0.1", port.to_string())
    }

    fn dead_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn fast_policy(tries: u32) -> ConnectPolicy {
        ConnectPolicy {
            tries,
            interval: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_connect_to_listening_peer() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let cancel = CancelToken::new();

        let mut endpoint = connect(&loopback(port), &SocketTuning::default(), &cancel).unwrap();
        let (mut peer, _) = server.accept().unwrap();

        peer.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < buf.len() {
            match endpoint.read(&mut buf[got..]) {
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_connect_gives_up_after_all_tries() {
        let cancel = CancelToken::new();
        let start = Instant::now();

        let err = connect_with(
            &loopback(dead_port()),
            &SocketTuning::default(),
            fast_policy(2),
            &cancel,
        )
        .unwrap_err();

        assert_eq!(err.reason_code(), "socket_setup_failed");
        // one pause between the two tries
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_connect_retries_until_peer_appears() {
        let port = dead_port();
        let addr = loopback(port);

        let client = thread::spawn(move || {
            let policy = ConnectPolicy {
                tries: 3,
                interval: Duration::from_millis(300),
            };
            connect_with(&addr, &SocketTuning::default(), policy, &CancelToken::new())
        });

        thread::sleep(Duration::from_millis(100));
        let server = TcpListener::bind(("127.0.0.1", port)).unwrap();

        let endpoint = client.join().unwrap();
        assert!(endpoint.is_ok());
        drop(server);
    }

    #[test]
    fn test_connect_interrupted_skips_retries() {
        let cancel = CancelToken::new();
        cancel.cancel(Signal::SIGINT);
        let start = Instant::now();

        let err = connect_with(
            &loopback(dead_port()),
            &SocketTuning::default(),
            ConnectPolicy::default(),
            &cancel,
        )
        .unwrap_err();

        assert!(matches!(err, RelayError::Interrupted(Signal::SIGINT)));
        assert!(start.elapsed() < CONNECT_RETRY_INTERVAL);
    }

    #[test]
    fn test_connect_resolution_failure_is_not_retried() {
        let cancel = CancelToken::new();
        let addr = EndpointAddr::new("127.0.0.1", "no-such-service-anywhere");

        let err = connect(&addr, &SocketTuning::default(), &cancel).unwrap_err();
        assert_eq!(err.reason_code(), "resolution_failed");
    }

    #[test]
    fn test_listener_accepts_one_peer() {
        let tuning = SocketTuning {
            send_buffer: Some(4096),
            recv_buffer: Some(4096),
        };
        let listener = Listener::bind(&loopback(0), &tuning).unwrap();
        let local = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(local).unwrap();
        let mut endpoint = listener.accept(&CancelToken::new()).unwrap();

        // listening socket is gone
        assert!(TcpStream::connect(local).is_err());

        endpoint.shutdown_write();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_accept_interrupted() {
        let listener = Listener::bind(&loopback(0), &SocketTuning::default()).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel(Signal::SIGTERM);

        let err = listener.accept(&cancel).unwrap_err();
        assert!(matches!(err, RelayError::Interrupted(Signal::SIGTERM)));
    }

    #[test]
    fn test_bind_conflict_is_setup_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Listener::bind(&loopback(port), &SocketTuning::default()).unwrap_err();
        assert_eq!(err.reason_code(), "socket_setup_failed");
    }
}
