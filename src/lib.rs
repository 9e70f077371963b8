//! # vmbridge
//!
//! Host/guest networking glue for VM-backed container runtimes.
//!
//! ## Features
//!
//! - **VM socket tunnels**: a host connector discovers the right VM with a
//!   signature handshake, listens on its VM socket port and forwards every
//!   connection to an upstream TCP address or named pipe; the peer connector
//!   inside the VM forwards local TCP connections back to the host
//! - **Half-close aware piping** between any two transports
//! - **Port proxy**: publishes container ports on the host from JSON port
//!   mappings sent over a control socket
//! - **Reverse proxy** for the Docker API with protocol upgrade support
//!
//! ## Architecture
//!
//! ```text
//!   guest (VM)                                   host
//! ┌──────────────────────┐                ┌──────────────────────────┐
//! │ app ──tcp──▶ Peer    │  vsock / tcp   │ Host ──▶ upstream        │
//! │        Connector ────┼───────────────▶│ Connector  (tcp, npipe)  │
//! │                      │                │                          │
//! │ Responder ◀──────────┼─ handshake ────┤ discover() races every   │
//! │  (signature, ready)  │                │ candidate VM             │
//! └──────────────────────┘                └──────────────────────────┘
//!
//!   control socket ──json──▶ PortProxy ──▶ 127.0.0.1:P ──▶ upstream:P
//!   docker client ──http──▶ ReverseProxy ──dial──▶ backend (101 ⇒ pipe)
//! ```

pub mod config;
pub mod logging;
pub mod portproxy;
pub mod protocol;
#[cfg(feature = "reverse-proxy")]
pub mod proxy;
pub mod shutdown;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Port proxy error: {0}")]
    PortProxy(#[from] portproxy::PortProxyError),

    #[cfg(feature = "reverse-proxy")]
    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
