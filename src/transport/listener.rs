//! Listening side of every supported transport

use super::BoxedStream;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, warn};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::UnixListener;

#[cfg(windows)]
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

#[cfg(all(feature = "vsock", target_os = "linux"))]
use tokio_vsock::VsockListener;

/// A listening socket of any supported transport
pub enum Listener {
    Tcp {
        inner: TcpListener,
        /// Only accept connections from this address
        allowed_peer: Option<IpAddr>,
    },
    #[cfg(unix)]
    Unix(UnixSocket),
    #[cfg(windows)]
    NamedPipe {
        path: String,
        /// Server instance waiting for the next client
        next: NamedPipeServer,
    },
    #[cfg(all(feature = "vsock", target_os = "linux"))]
    Vsock {
        inner: VsockListener,
        /// Only accept connections from this context id
        allowed_cid: Option<u32>,
    },
}

/// Unix listener that unlinks its socket file when dropped
#[cfg(unix)]
pub struct UnixSocket {
    inner: UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl Drop for UnixSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Listener {
    /// Bind a TCP listener, optionally restricted to a single peer address
    pub async fn bind_tcp<A: ToSocketAddrs>(
        addr: A,
        allowed_peer: Option<IpAddr>,
    ) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Listener::Tcp {
            inner,
            allowed_peer,
        })
    }

    /// Wrap an already bound TCP listener
    pub fn from_tcp(inner: TcpListener) -> Self {
        Listener::Tcp {
            inner,
            allowed_peer: None,
        }
    }

    /// Bind a unix domain socket, replacing a stale socket file left behind
    /// by a previous process
    #[cfg(unix)]
    pub async fn bind_unix(path: &str) -> io::Result<Self> {
        use std::os::unix::fs::FileTypeExt;

        let path = PathBuf::from(path);
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if !meta.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                ));
            }
            if tokio::net::UnixStream::connect(&path).await.is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is already being served", path.display()),
                ));
            }
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(&path)?;
        }

        let inner = UnixListener::bind(&path)?;
        Ok(Listener::Unix(UnixSocket { inner, path }))
    }

    #[cfg(not(unix))]
    pub async fn bind_unix(path: &str) -> io::Result<Self> {
        Err(super::unsupported(format!("unix socket {}", path)))
    }

    /// Create the first instance of a named pipe server
    #[cfg(windows)]
    pub fn bind_named_pipe(path: &str) -> io::Result<Self> {
        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(path)?;
        Ok(Listener::NamedPipe {
            path: path.to_string(),
            next,
        })
    }

    #[cfg(not(windows))]
    pub fn bind_named_pipe(path: &str) -> io::Result<Self> {
        Err(super::unsupported(format!("named pipe {}", path)))
    }

    /// Bind a vsock listener on `cid:port`, optionally restricted to one peer context id
    #[cfg(all(feature = "vsock", target_os = "linux"))]
    pub fn bind_vsock(cid: u32, port: u32, allowed_cid: Option<u32>) -> io::Result<Self> {
        let inner = VsockListener::bind(tokio_vsock::VsockAddr::new(cid, port))?;
        Ok(Listener::Vsock { inner, allowed_cid })
    }

    #[cfg(not(all(feature = "vsock", target_os = "linux")))]
    pub fn bind_vsock(cid: u32, port: u32, _allowed_cid: Option<u32>) -> io::Result<Self> {
        Err(super::unsupported(format!("vsock {}:{}", cid, port)))
    }

    /// Accept the next connection.
    ///
    /// Returns the stream and a printable description of the peer.
    pub async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp {
                inner,
                allowed_peer,
            } => loop {
                let (stream, peer) = inner.accept().await?;
                if let Some(allowed) = allowed_peer {
                    if peer.ip() != *allowed {
                        warn!("Rejecting connection from unexpected peer {}", peer);
                        continue;
                    }
                }
                stream.set_nodelay(true).ok();
                return Ok((Box::new(stream), peer.to_string()));
            },
            #[cfg(unix)]
            Listener::Unix(socket) => {
                let (stream, _) = socket.inner.accept().await?;
                Ok((Box::new(stream), socket.path.display().to_string()))
            }
            #[cfg(windows)]
            Listener::NamedPipe { path, next } => {
                next.connect().await?;
                let fresh = ServerOptions::new().create(path.as_str())?;
                let connected = std::mem::replace(next, fresh);
                Ok((Box::new(connected), path.clone()))
            }
            #[cfg(all(feature = "vsock", target_os = "linux"))]
            Listener::Vsock { inner, allowed_cid } => loop {
                let (stream, peer) = inner.accept().await?;
                if let Some(allowed) = allowed_cid {
                    if peer.cid() != *allowed {
                        warn!("Rejecting vsock connection from unexpected cid {}", peer.cid());
                        continue;
                    }
                }
                return Ok((
                    Box::new(stream),
                    format!("vsock://{}:{}", peer.cid(), peer.port()),
                ));
            },
        }
    }

    /// Bound TCP address, if this is a TCP listener
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp { inner, .. } => inner.local_addr().ok(),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    /// Printable description of the local side
    pub fn describe(&self) -> String {
        match self {
            Listener::Tcp { inner, .. } => inner
                .local_addr()
                .map(|a| format!("tcp://{}", a))
                .unwrap_or_else(|_| "tcp://<unknown>".to_string()),
            #[cfg(unix)]
            Listener::Unix(socket) => format!("unix://{}", socket.path.display()),
            #[cfg(windows)]
            Listener::NamedPipe { path, .. } => format!("npipe://{}", path),
            #[cfg(all(feature = "vsock", target_os = "linux"))]
            Listener::Vsock { inner, .. } => inner
                .local_addr()
                .map(|a| format!("vsock://{}:{}", a.cid(), a.port()))
                .unwrap_or_else(|_| "vsock://<unknown>".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_peer_filter() {
        let mut listener = Listener::bind_tcp("127.0.0.1:0", Some("127.0.0.1".parse().unwrap()))
            .await
            .unwrap();
        let addr = listener.tcp_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut s = tokio::net::TcpStream::connect(addr).await.unwrap();
            s.write_all(b"hi").await.unwrap();
        });

        let (mut stream, peer) = listener.accept().await.unwrap();
        assert!(peer.starts_with("127.0.0.1:"));
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_replaces_stale_file_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let path_str = path.to_str().unwrap();

        // A socket file nobody serves
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let listener = Listener::bind_unix(path_str).await.unwrap();
        assert_eq!(listener.describe(), format!("unix://{}", path_str));

        // A live socket refuses to be replaced
        assert!(Listener::bind_unix(path_str).await.is_err());

        drop(listener);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_keeps_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"data").unwrap();

        let err = Listener::bind_unix(path.to_str().unwrap()).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }
}
