//! Transport layer
//!
//! Everything above this layer talks in terms of [`BoxedStream`]s and
//! [`Listener`]s and never cares which socket family is underneath:
//! - TCP
//! - Unix domain sockets
//! - Windows named pipes
//! - vsock (Linux, `vsock` feature)
//!
//! Every stream supports half-close through `AsyncWriteExt::shutdown`.

mod listener;
mod tcp;
mod vm;

#[cfg(all(feature = "vsock", target_os = "linux"))]
mod vsock;

pub use listener::Listener;
pub use tcp::{connect_tcp, join_host_port};
pub use vm::{TcpSockets, VmSockets};

#[cfg(all(feature = "vsock", target_os = "linux"))]
pub use vsock::{VsockSockets, HOST_CID};

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported transport: {0}")]
    Unsupported(String),

    #[error("Timeout")]
    Timeout,
}

/// A byte stream whose write side can be shut down independently
pub trait HalfDuplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> HalfDuplex for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connection
pub type BoxedStream = Box<dyn HalfDuplex>;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
        }
    }
}

const UNIX_PREFIX: &str = "unix://";
const NPIPE_PREFIX: &str = "npipe://";
const VSOCK_PREFIX: &str = "vsock://";
const TCP_PREFIX: &str = "tcp://";

/// Address of something we can dial or listen on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    /// Filesystem path of a unix domain socket
    Unix(String),
    /// Windows named pipe path (e.g. `//./pipe/docker_engine`)
    NamedPipe(String),
    /// vsock context id and port
    Vsock { cid: u32, port: u32 },
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidAddress(s.to_string());

        if let Some(path) = s.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::Unix(path.to_string()));
        }

        if let Some(path) = s.strip_prefix(NPIPE_PREFIX) {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::NamedPipe(path.to_string()));
        }

        if let Some(rest) = s.strip_prefix(VSOCK_PREFIX) {
            let (cid, port) = rest.split_once(':').ok_or_else(invalid)?;
            let cid = cid.parse().map_err(|_| invalid())?;
            let port = port.parse().map_err(|_| invalid())?;
            return Ok(Endpoint::Vsock { cid, port });
        }

        let hostport = s.strip_prefix(TCP_PREFIX).unwrap_or(s);
        let (host, port) = hostport.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(invalid());
        }
        Ok(Endpoint::Tcp(hostport.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}{}", TCP_PREFIX, addr),
            Endpoint::Unix(path) => write!(f, "{}{}", UNIX_PREFIX, path),
            Endpoint::NamedPipe(path) => write!(f, "{}{}", NPIPE_PREFIX, path),
            Endpoint::Vsock { cid, port } => write!(f, "{}{}:{}", VSOCK_PREFIX, cid, port),
        }
    }
}

impl Endpoint {
    /// Dial the endpoint, giving up after `timeout`
    pub async fn dial(&self, timeout: Duration) -> io::Result<BoxedStream> {
        match self {
            Endpoint::Tcp(addr) => Ok(Box::new(connect_tcp(addr.as_str(), timeout).await?)),
            Endpoint::Unix(path) => dial_unix(path, timeout).await,
            Endpoint::NamedPipe(path) => dial_named_pipe(path, timeout).await,
            Endpoint::Vsock { cid, port } => dial_vsock(*cid, *port, timeout).await,
        }
    }

    /// Start listening on the endpoint
    pub async fn listen(&self) -> io::Result<Listener> {
        match self {
            Endpoint::Tcp(addr) => Listener::bind_tcp(addr.as_str(), None).await,
            Endpoint::Unix(path) => Listener::bind_unix(path).await,
            Endpoint::NamedPipe(path) => Listener::bind_named_pipe(path),
            Endpoint::Vsock { cid, port } => Listener::bind_vsock(*cid, *port, None),
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}

#[cfg(unix)]
async fn dial_unix(path: &str, timeout: Duration) -> io::Result<BoxedStream> {
    let stream = with_timeout(timeout, tokio::net::UnixStream::connect(path)).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn dial_unix(path: &str, _timeout: Duration) -> io::Result<BoxedStream> {
    Err(unsupported(format!("unix socket {}", path)))
}

#[cfg(windows)]
async fn dial_named_pipe(path: &str, timeout: Duration) -> io::Result<BoxedStream> {
    use tokio::net::windows::named_pipe::ClientOptions;

    // ERROR_PIPE_BUSY: every server instance is taken, try again shortly.
    const ERROR_PIPE_BUSY: i32 = 231;

    let path = path.to_string();
    with_timeout(timeout, async move {
        loop {
            match ClientOptions::new().open(&path) {
                Ok(client) => return Ok::<BoxedStream, io::Error>(Box::new(client)),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
}

#[cfg(not(windows))]
async fn dial_named_pipe(path: &str, _timeout: Duration) -> io::Result<BoxedStream> {
    Err(unsupported(format!("named pipe {}", path)))
}

#[cfg(all(feature = "vsock", target_os = "linux"))]
async fn dial_vsock(cid: u32, port: u32, timeout: Duration) -> io::Result<BoxedStream> {
    vsock::connect(cid, port, timeout).await
}

#[cfg(not(all(feature = "vsock", target_os = "linux")))]
async fn dial_vsock(cid: u32, port: u32, _timeout: Duration) -> io::Result<BoxedStream> {
    Err(unsupported(format!("vsock {}:{}", cid, port)))
}

pub(crate) fn unsupported(what: String) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not supported on this platform", what),
    )
}
