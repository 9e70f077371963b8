//! Handshake protocol definitions and constants
//!
//! The guest side advertises [`SIGNATURE_PHRASE`] on a well-known port. The
//! host races every candidate VM for it and, once the right one is found,
//! optionally answers with [`READY_SIGNAL`] on a fresh connection.

mod handshake;

pub use handshake::{discover, signal_ready, HandshakeOptions, ReadyWatch, Responder};

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no candidate VM found")]
    NoCandidates,

    #[error("could not find the peer process on any VM within {0:?}")]
    PeerNotFound(Duration),

    #[error("peer answered with an unexpected signature")]
    SignatureMismatch,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Written by the peer on every handshake connection
pub const SIGNATURE_PHRASE: &[u8] = b"vmbridge/vsock-peer/handshake-signature";

/// Written by the host once its data-plane listener is up
pub const READY_SIGNAL: &[u8] = b"vmbridge/vsock-host/ready";

/// Discovery timeout for tunnels
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between dial attempts to the same candidate
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest accepted delay between dial attempts
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// How long the responder waits for a ready marker
pub const RESPONDER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether the host confirms readiness after discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakeMode {
    /// Discovery only
    OneShot,
    /// Discovery followed by a ready marker once the host listens
    #[default]
    TwoPhase,
}

impl std::str::FromStr for HandshakeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "one-shot" | "oneshot" => Ok(HandshakeMode::OneShot),
            "two-phase" | "twophase" => Ok(HandshakeMode::TwoPhase),
            other => Err(format!("unknown handshake mode: {}", other)),
        }
    }
}
