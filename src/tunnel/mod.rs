//! Tunnel layer - glue between a VM socket and a local transport
//!
//! Provides:
//! - Half-close aware piping
//! - Host connector (VM socket listener -> upstream TCP / named pipe)
//! - Peer connector (local TCP listener -> VM socket on the host)
//! - Runners for many independent tunnel definitions

mod host;
mod peer;
mod pipe;

pub use host::HostConnector;
pub use peer::PeerConnector;
pub use pipe::{is_benign_disconnect, pipe};

use crate::config::{HandshakeConfig, TunnelDefinition};
use crate::protocol::ProtocolError;
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::transport::{join_host_port, BoxedStream, Endpoint, TransportError, VmSockets};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to listen on {address}: {source}")]
    Listen { address: String, source: io::Error },

    #[error("Invalid tunnel definition: {0}")]
    InvalidDefinition(String),
}

/// Buffer size for each copy direction (32 KB)
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Pause before rebuilding a tunnel whose listener failed
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Accept errors that only concern one connection attempt
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    // EMFILE / ENFILE: back off and let connections drain
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(23) | Some(24)) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::PermissionDenied
    )
}

/// Dial the far side for an accepted connection and pipe the two together.
///
/// Failures only affect this connection and are logged.
pub(crate) async fn splice<F>(component: &str, mut inbound: BoxedStream, target: &str, dial: F)
where
    F: Future<Output = io::Result<BoxedStream>>,
{
    let mut outbound = match dial.await {
        Ok(stream) => stream,
        Err(e) => {
            error!("{}: failed dialing into {}: {}", component, target, e);
            return;
        }
    };

    match pipe(&mut inbound, &mut outbound).await {
        Ok(()) => debug!("{}: stream to {} finished", component, target),
        Err(e) if is_benign_disconnect(&e) => {
            debug!("{}: stream to {} closed by peer: {}", component, target, e)
        }
        Err(e) => error!("{}: stream error to {}: {}", component, target, e),
    }
}

/// Run one host connector per tunnel definition until shutdown.
///
/// Returns the first fatal error; the remaining tunnels are stopped first.
pub async fn run_host_tunnels<P: VmSockets>(
    sockets: Arc<P>,
    tunnels: &[TunnelDefinition],
    handshake: &HandshakeConfig,
    connect_timeout: Duration,
    shutdown: ShutdownSignal,
) -> Result<(), TunnelError> {
    let mut connectors = Vec::with_capacity(tunnels.len());
    for tunnel in tunnels {
        let upstream: Endpoint = tunnel.upstream_server_address.parse()?;
        let connector = HostConnector::new(
            sockets.clone(),
            upstream,
            tunnel.vsock_host_port,
            handshake.options(tunnel.handshake_port),
        )
        .with_mode(handshake.mode)
        .with_connect_timeout(connect_timeout);
        connectors.push(connector);
    }

    supervise(connectors, shutdown, |connector, signal| connector.run(signal)).await
}

/// Run one peer connector per tunnel definition until shutdown.
pub async fn run_peer_tunnels<P: VmSockets>(
    sockets: Arc<P>,
    host: P::Id,
    tunnels: &[TunnelDefinition],
    handshake: &HandshakeConfig,
    shutdown: ShutdownSignal,
) -> Result<(), TunnelError> {
    let connectors: Vec<PeerConnector<P>> = tunnels
        .iter()
        .map(|tunnel| {
            PeerConnector::new(
                sockets.clone(),
                host.clone(),
                join_host_port(&tunnel.peer_address, tunnel.peer_port),
                tunnel.vsock_host_port,
                tunnel.handshake_port,
            )
            .with_mode(handshake.mode)
            .with_ready_timeout(handshake.timeout())
        })
        .collect();

    supervise(connectors, shutdown, |connector, signal| connector.run(signal)).await
}

async fn supervise<T, F, Fut>(
    units: Vec<T>,
    mut shutdown: ShutdownSignal,
    run: F,
) -> Result<(), TunnelError>
where
    T: Send + 'static,
    F: Fn(T, ShutdownSignal) -> Fut,
    Fut: Future<Output = Result<(), TunnelError>> + Send + 'static,
{
    let total = units.len();
    let stop = Arc::new(Shutdown::new());

    // Outer shutdown stops every unit
    let forward = {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown.recv().await;
            stop.trigger();
        })
    };

    let (done_tx, mut done_rx) = mpsc::channel(total.max(1));
    for (index, unit) in units.into_iter().enumerate() {
        let fut = run(unit, stop.subscribe());
        let done = done_tx.clone();
        tokio::spawn(async move {
            let _ = done.send((index, fut.await)).await;
        });
    }
    drop(done_tx);

    let mut first_err = None;
    while let Some((index, result)) = done_rx.recv().await {
        match result {
            Ok(()) => info!("tunnel #{} stopped", index),
            Err(e) => {
                error!("tunnel #{} failed: {}", index, e);
                stop.trigger();
                first_err.get_or_insert(e);
            }
        }
    }
    forward.abort();

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }

    #[tokio::test]
    async fn test_supervise_returns_first_error_and_stops_siblings() {
        let shutdown = Shutdown::new();
        let units = vec![0u32, 1];

        let res = supervise(units, shutdown.subscribe(), |unit, mut signal| async move {
            if unit == 0 {
                Err(TunnelError::InvalidDefinition("boom".to_string()))
            } else {
                // Only returns because the failing sibling stops it
                signal.recv().await;
                Ok(())
            }
        })
        .await;

        assert!(matches!(res, Err(TunnelError::InvalidDefinition(_))));
    }

    #[tokio::test]
    async fn test_supervise_honours_outer_shutdown() {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        shutdown.trigger();

        let res = supervise(vec![(), ()], signal, |_, mut signal| async move {
            signal.recv().await;
            Ok(())
        })
        .await;
        assert!(res.is_ok());
    }
}
