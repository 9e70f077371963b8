//! Guest side of a tunnel

use super::{is_transient_accept_error, splice, TunnelError};
use crate::protocol::{HandshakeMode, ReadyWatch, Responder, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::shutdown::ShutdownSignal;
use crate::transport::{Listener, VmSockets};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Answers the host's handshake and forwards local TCP connections to the
/// host's VM socket port.
pub struct PeerConnector<P: VmSockets> {
    sockets: Arc<P>,
    host: P::Id,
    listen_address: String,
    host_port: u32,
    handshake_port: u32,
    mode: HandshakeMode,
    ready_timeout: Duration,
}

impl<P: VmSockets> PeerConnector<P> {
    /// `listen_address` is the local `host:port` applications connect to
    pub fn new(
        sockets: Arc<P>,
        host: P::Id,
        listen_address: String,
        host_port: u32,
        handshake_port: u32,
    ) -> Self {
        Self {
            sockets,
            host,
            listen_address,
            host_port,
            handshake_port,
            mode: HandshakeMode::default(),
            ready_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_mode(mut self, mode: HandshakeMode) -> Self {
        self.mode = mode;
        self
    }

    /// How long the first forwarded connection waits for the host's ready marker
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Run the handshake responder and the TCP accept loop until shutdown
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), TunnelError> {
        let handshake_listener = self
            .sockets
            .listen(None, self.handshake_port)
            .await
            .map_err(|source| TunnelError::Listen {
                address: format!("handshake port {}", self.handshake_port),
                source,
            })?;
        let responder = Responder::new(handshake_listener);
        let ready = responder.ready();

        let tcp = Listener::bind_tcp(self.listen_address.as_str(), None)
            .await
            .map_err(|source| TunnelError::Listen {
                address: self.listen_address.clone(),
                source,
            })?;
        info!(
            "peer connector: listening on {}, forwarding to {}:{}",
            tcp.describe(),
            self.host,
            self.host_port
        );

        // Either both stop on shutdown, or a broken TCP listener takes the
        // responder down with it.
        tokio::select! {
            res = responder.run(shutdown.clone()) => Ok(res?),
            res = self.accept_loop(tcp, ready, shutdown) => res,
        }
    }

    async fn accept_loop(
        &self,
        mut listener: Listener,
        ready: ReadyWatch,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), TunnelError> {
        let target = format!("{}:{}", self.host, self.host_port);

        loop {
            let (conn, peer) = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("peer connector: shutting down {}", listener.describe());
                    return Ok(());
                }
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("peer connector: accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            debug!("peer connector: accepted connection from {}", peer);

            let sockets = self.sockets.clone();
            let host = self.host.clone();
            let port = self.host_port;
            let target = target.clone();
            let mut ready = ready.clone();
            let wait_for_ready = self.mode == HandshakeMode::TwoPhase;
            let ready_timeout = self.ready_timeout;

            tokio::spawn(async move {
                if wait_for_ready && !ready.wait(ready_timeout).await {
                    warn!("peer connector: host has not signalled ready, dialing anyway");
                }
                splice("peer connector", conn, &target, sockets.dial(&host, port)).await;
            });
        }
    }
}
