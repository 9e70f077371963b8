//! Host side of a tunnel

use super::{is_transient_accept_error, splice, TunnelError, RECONNECT_DELAY};
use crate::protocol::{discover, signal_ready, HandshakeMode, HandshakeOptions};
use crate::shutdown::ShutdownSignal;
use crate::transport::{Endpoint, Listener, TransportConfig, VmSockets};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Listens on a VM socket port and forwards every connection to an upstream
/// TCP address or named pipe.
pub struct HostConnector<P: VmSockets> {
    sockets: Arc<P>,
    upstream: Endpoint,
    data_port: u32,
    handshake: HandshakeOptions,
    mode: HandshakeMode,
    connect_timeout: Duration,
}

impl<P: VmSockets> HostConnector<P> {
    pub fn new(
        sockets: Arc<P>,
        upstream: Endpoint,
        data_port: u32,
        handshake: HandshakeOptions,
    ) -> Self {
        Self {
            sockets,
            upstream,
            data_port,
            handshake,
            mode: HandshakeMode::default(),
            connect_timeout: TransportConfig::default().connect_timeout(),
        }
    }

    pub fn with_mode(mut self, mode: HandshakeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Find the peer's VM, listen for it on the data port and, in two-phase
    /// mode, tell it the listener is up.
    pub async fn establish(&self) -> Result<(P::Id, Listener), TunnelError> {
        let vm = discover(self.sockets.clone(), &self.handshake).await?;

        let listener = self
            .sockets
            .listen(Some(&vm), self.data_port)
            .await
            .map_err(|source| TunnelError::Listen {
                address: format!("VM socket port {}", self.data_port),
                source,
            })?;
        info!(
            "host connector: listening on {} for VM {}, forwarding to {}",
            listener.describe(),
            vm,
            self.upstream
        );

        if self.mode == HandshakeMode::TwoPhase {
            signal_ready(
                &*self.sockets,
                &vm,
                self.handshake.port,
                self.handshake.timeout,
            )
            .await?;
        }

        Ok((vm, listener))
    }

    /// Serve until shutdown.
    ///
    /// A failing first discovery is fatal. If the listener breaks later, the
    /// whole discovery + listen sequence is retried after a short pause.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<(), TunnelError> {
        let (mut vm, mut listener) = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            res = self.establish() => res?,
        };

        loop {
            match self.accept_loop(&mut listener, &mut shutdown).await {
                Ok(()) => {
                    debug!("host connector: shutting down listener for VM {}", vm);
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        "host connector: listener for VM {} failed: {}, re-establishing",
                        vm, e
                    );
                }
            }
            drop(listener);

            (vm, listener) = loop {
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
                match self.establish().await {
                    Ok(established) => break established,
                    Err(e) => warn!("host connector: re-establishing tunnel failed: {}", e),
                }
            };
        }
    }

    async fn accept_loop(
        &self,
        listener: &mut Listener,
        shutdown: &mut ShutdownSignal,
    ) -> io::Result<()> {
        loop {
            let (conn, peer) = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("host connector: accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            debug!("host connector: accepted connection from {}", peer);
            let upstream = self.upstream.clone();
            let timeout = self.connect_timeout;
            tokio::spawn(async move {
                let target = upstream.to_string();
                splice("host connector", conn, &target, upstream.dial(timeout)).await;
            });
        }
    }
}
