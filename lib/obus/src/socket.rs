//! Address parsing and the client/server socket wrappers: the
//! inet/inet6/unix address grammar and reconnect/bind-retry behavior.
//!
//! Grounded in `neutronium::net::endpoint::Endpoint::new`'s bind call
//! and accept loop, generalized from TCP-only to the inet/inet6/unix
//! trio the grammar requires.

use std::net::SocketAddr;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use mio::net::{UnixListener, UnixStream};
use mio::{Interest, Token};

use crate::error::ObusError;

/// Reconnect and bind-retry backoff.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// A parsed bus endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Inet(SocketAddr),
    #[cfg(unix)]
    Unix { path: String, abstract_namespace: bool },
}

impl Address {
    /// Parses `"inet:<addr>:<port>"`, `"inet6:<addr>:<port>"`, or
    /// `"unix:<path>"` (`@`-prefixed path selects the abstract
    /// namespace where the platform supports it).
    pub fn parse(spec: &str) -> Result<Address, ObusError> {
        let (scheme, rest) = spec
            .split_once(':')
            .ok_or_else(|| ObusError::invalid_argument(format!("missing scheme in address '{}'", spec)))?;

        match scheme {
            "inet" | "inet6" => {
                let socket_addr: SocketAddr = rest
                    .parse()
                    .map_err(|_| ObusError::invalid_argument(format!("invalid inet address '{}'", rest)))?;
                Ok(Address::Inet(socket_addr))
            }
            #[cfg(unix)]
            "unix" => {
                let (path, abstract_namespace) = match rest.strip_prefix('@') {
                    Some(name) => (name.to_string(), true),
                    None => (rest.to_string(), false),
                };
                if path.is_empty() {
                    return Err(ObusError::invalid_argument("empty unix socket path"));
                }
                Ok(Address::Unix { path, abstract_namespace })
            }
            #[cfg(not(unix))]
            "unix" => Err(ObusError::invalid_argument("unix sockets are not supported on this platform")),
            other => Err(ObusError::invalid_argument(format!("unknown address scheme '{}'", other))),
        }
    }
}

/// Either stream kind a client or accepted peer might be speaking over.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl std::io::Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl std::io::Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl mio::event::Source for Stream {
    fn register(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            Stream::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            Stream::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.deregister(registry),
            #[cfg(unix)]
            Stream::Unix(s) => s.deregister(registry),
        }
    }
}

impl Stream {
    /// Connects (non-blocking) to `address`. `mio::net` streams are
    /// created non-blocking already; a `connect` that would otherwise
    /// block returns immediately and the engine waits for writable
    /// readiness to know when it completes. The
    /// caller is expected to retry on failure using [`RETRY_INTERVAL`]
    /// via the reactor's timer.
    pub fn connect(address: &Address) -> std::io::Result<Stream> {
        match address {
            Address::Inet(addr) => Ok(Stream::Tcp(TcpStream::connect(*addr)?)),
            #[cfg(unix)]
            Address::Unix { path, abstract_namespace } => {
                if *abstract_namespace {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "abstract namespace connect requires platform support not exposed by mio",
                    ));
                }
                Ok(Stream::Unix(UnixStream::connect(path)?))
            }
        }
    }
}

/// A bound, listening server socket.
pub enum ServerSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl ServerSocket {
    /// Binds and listens on `address`. `EADDRNOTAVAIL` is reported back
    /// to the caller as-is (rather than retried here) so the engine can
    /// drive the 500 ms retry through its own timer, matching the
    /// §4.3.
    pub fn bind(address: &Address) -> std::io::Result<ServerSocket> {
        match address {
            Address::Inet(addr) => Ok(ServerSocket::Tcp(TcpListener::bind(*addr)?)),
            #[cfg(unix)]
            Address::Unix { path, abstract_namespace } => {
                if *abstract_namespace {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "abstract namespace bind requires platform support not exposed by mio",
                    ));
                }
                Ok(ServerSocket::Unix(UnixListener::bind(path)?))
            }
        }
    }

    pub fn accept(&self) -> std::io::Result<(Stream, Option<u32>)> {
        match self {
            ServerSocket::Tcp(listener) => {
                let (stream, _addr) = listener.accept()?;
                Ok((Stream::Tcp(stream), None))
            }
            #[cfg(unix)]
            ServerSocket::Unix(listener) => {
                let (stream, _addr) = listener.accept()?;
                let pid = peer_pid(&stream);
                Ok((Stream::Unix(stream), pid))
            }
        }
    }
}

impl mio::event::Source for ServerSocket {
    fn register(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        match self {
            ServerSocket::Tcp(s) => s.register(registry, token, interests),
            #[cfg(unix)]
            ServerSocket::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(&mut self, registry: &mio::Registry, token: Token, interests: Interest) -> std::io::Result<()> {
        match self {
            ServerSocket::Tcp(s) => s.reregister(registry, token, interests),
            #[cfg(unix)]
            ServerSocket::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        match self {
            ServerSocket::Tcp(s) => s.deregister(registry),
            #[cfg(unix)]
            ServerSocket::Unix(s) => s.deregister(registry),
        }
    }
}

/// Reads the peer's PID via `SO_PEERCRED`, when the platform exposes it
/// Returns `None` everywhere else rather than failing
/// the accept.
#[cfg(target_os = "linux")]
fn peer_pid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsRawFd;

    let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = std::mem::size_of::<libc::ucred>() as u32;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut std::ffi::c_void,
            &mut len,
        )
    };
    if rc == 0 && cred.pid > 0 {
        Some(cred.pid as u32)
    } else {
        None
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn peer_pid(_stream: &UnixStream) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inet_address() {
        let addr = Address::parse("inet:127.0.0.1:4000").unwrap();
        assert_eq!(addr, Address::Inet("127.0.0.1:4000".parse().unwrap()));
    }

    #[test]
    fn parses_inet6_address() {
        let addr = Address::parse("inet6:[::1]:4000").unwrap();
        assert_eq!(addr, Address::Inet("[::1]:4000".parse().unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_path_address() {
        let addr = Address::parse("unix:/tmp/obus.sock").unwrap();
        assert_eq!(
            addr,
            Address::Unix { path: "/tmp/obus.sock".to_string(), abstract_namespace: false }
        );
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_abstract_address() {
        let addr = Address::parse("unix:@obus").unwrap();
        assert_eq!(addr, Address::Unix { path: "obus".to_string(), abstract_namespace: true });
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Address::parse("carrier-pigeon:nowhere").is_err());
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(Address::parse("127.0.0.1:4000").is_err());
    }
}
