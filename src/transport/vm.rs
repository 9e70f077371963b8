//! Sockets addressed by virtual machine identity
//!
//! The handshake and the tunnel connectors only know that a VM is reached by
//! an id plus a port. How ids are enumerated and how the port is turned into
//! a socket is up to the provider.

use super::{connect_tcp, BoxedStream, Listener, TransportError};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Provider of VM-scoped sockets
#[async_trait]
pub trait VmSockets: Send + Sync + 'static {
    /// Opaque VM identity
    type Id: Clone + fmt::Display + fmt::Debug + PartialEq + Send + Sync + 'static;

    /// Every VM that could be hosting the peer process
    async fn candidates(&self) -> Result<Vec<Self::Id>, TransportError>;

    /// Parse an id given on the command line or in a config file
    fn parse_id(&self, s: &str) -> Result<Self::Id, TransportError>;

    /// Connect to `port` on the VM identified by `id`
    async fn dial(&self, id: &Self::Id, port: u32) -> io::Result<BoxedStream>;

    /// Listen on `port` for connections coming from `id`, or from anyone
    async fn listen(&self, id: Option<&Self::Id>, port: u32) -> io::Result<Listener>;
}

/// VM sockets over plain TCP, for VMs reachable by IP address
#[derive(Debug, Clone)]
pub struct TcpSockets {
    candidates: Vec<IpAddr>,
    bind_address: IpAddr,
    connect_timeout: Duration,
}

impl TcpSockets {
    /// `bind_address` is the local address listeners bind to
    pub fn new(candidates: Vec<IpAddr>, bind_address: IpAddr) -> Self {
        Self {
            candidates,
            bind_address,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

fn tcp_port(port: u32) -> io::Result<u16> {
    u16::try_from(port).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("port {} out of range for tcp", port),
        )
    })
}

#[async_trait]
impl VmSockets for TcpSockets {
    type Id = IpAddr;

    async fn candidates(&self) -> Result<Vec<IpAddr>, TransportError> {
        Ok(self.candidates.clone())
    }

    fn parse_id(&self, s: &str) -> Result<IpAddr, TransportError> {
        s.parse()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))
    }

    async fn dial(&self, id: &IpAddr, port: u32) -> io::Result<BoxedStream> {
        let addr = SocketAddr::new(*id, tcp_port(port)?);
        Ok(Box::new(connect_tcp(addr, self.connect_timeout).await?))
    }

    async fn listen(&self, id: Option<&IpAddr>, port: u32) -> io::Result<Listener> {
        let addr = SocketAddr::new(self.bind_address, tcp_port(port)?);
        Listener::bind_tcp(addr, id.copied()).await
    }
}
