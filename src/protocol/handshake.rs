//! VM discovery handshake

use super::{
    ProtocolError, DEFAULT_HANDSHAKE_TIMEOUT, MIN_RETRY_INTERVAL, READY_SIGNAL,
    RESPONDER_READ_TIMEOUT, RETRY_INTERVAL, SIGNATURE_PHRASE,
};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::transport::{BoxedStream, Listener, VmSockets};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Handshake tuning
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Port the peer's responder listens on
    pub port: u32,
    /// Upper bound for the whole discovery
    pub timeout: Duration,
    /// Delay between dial attempts to one candidate
    pub retry_interval: Duration,
}

impl HandshakeOptions {
    pub fn new(port: u32) -> Self {
        Self {
            port,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_interval: RETRY_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Intervals shorter than [`MIN_RETRY_INTERVAL`] are raised to it
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval.max(MIN_RETRY_INTERVAL);
        self
    }
}

/// Find the VM that runs the peer process.
///
/// Every candidate is probed concurrently; the first one that presents the
/// signature wins. All other attempts are cancelled and their connections
/// dropped before this returns.
pub async fn discover<P: VmSockets>(
    sockets: Arc<P>,
    options: &HandshakeOptions,
) -> Result<P::Id, ProtocolError> {
    let candidates = sockets.candidates().await?;
    if candidates.is_empty() {
        return Err(ProtocolError::NoCandidates);
    }
    debug!(
        "handshake: probing {} candidate VM(s) on port {}",
        candidates.len(),
        options.port
    );

    let (found_tx, mut found_rx) = mpsc::channel(candidates.len());
    let cancel = Shutdown::new();

    let probes: Vec<JoinHandle<()>> = candidates
        .into_iter()
        .map(|id| {
            tokio::spawn(probe_candidate(
                sockets.clone(),
                id,
                options.clone(),
                found_tx.clone(),
                cancel.subscribe(),
            ))
        })
        .collect();
    drop(found_tx);

    let outcome = tokio::time::timeout(options.timeout, found_rx.recv()).await;

    cancel.trigger();
    for probe in probes {
        if let Err(e) = probe.await {
            error!("handshake: probe task failed: {}", e);
        }
    }

    match outcome {
        Ok(Some(id)) => {
            info!("handshake: found peer process on VM {}", id);
            Ok(id)
        }
        Ok(None) | Err(_) => Err(ProtocolError::PeerNotFound(options.timeout)),
    }
}

async fn probe_candidate<P: VmSockets>(
    sockets: Arc<P>,
    id: P::Id,
    options: HandshakeOptions,
    found: mpsc::Sender<P::Id>,
    mut cancel: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(options.retry_interval.max(MIN_RETRY_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // At most one dial in flight per candidate
    let mut in_flight: Option<JoinHandle<bool>> = None;

    loop {
        tokio::select! {
            _ = cancel.recv() => break,
            _ = ticker.tick() => {
                if let Some(attempt) = in_flight.take() {
                    if !attempt.is_finished() {
                        trace!("handshake: previous dial to VM {} still pending", id);
                        in_flight = Some(attempt);
                        continue;
                    }
                    if matches!(attempt.await, Ok(true)) {
                        break;
                    }
                }
                in_flight = Some(tokio::spawn(attempt_handshake(
                    sockets.clone(),
                    id.clone(),
                    options.port,
                    found.clone(),
                    cancel.clone(),
                )));
            }
        }
    }

    if let Some(attempt) = in_flight {
        attempt.abort();
        let _ = attempt.await;
    }
}

/// One dial + verify. Returns true when the signature matched.
async fn attempt_handshake<P: VmSockets>(
    sockets: Arc<P>,
    id: P::Id,
    port: u32,
    found: mpsc::Sender<P::Id>,
    mut cancel: ShutdownSignal,
) -> bool {
    let attempt = async {
        let mut conn = sockets.dial(&id, port).await?;
        read_signature(&mut conn).await
    };

    tokio::select! {
        _ = cancel.recv() => false,
        res = attempt => match res {
            Ok(true) => {
                let _ = found.try_send(id.clone());
                true
            }
            Ok(false) => {
                debug!("handshake: VM {} answered with an unexpected signature", id);
                false
            }
            Err(e) => {
                trace!("handshake: probing VM {} failed: {}", id, e);
                false
            }
        }
    }
}

async fn read_signature(conn: &mut BoxedStream) -> io::Result<bool> {
    let mut buf = vec![0u8; SIGNATURE_PHRASE.len()];
    conn.read_exact(&mut buf).await?;
    Ok(buf == SIGNATURE_PHRASE)
}

/// Tell the peer on VM `id` that the host side is ready.
///
/// The connection is verified against the signature first, then the ready
/// marker is written and the write side closed. Returns once the peer has
/// hung up.
pub async fn signal_ready<P: VmSockets>(
    sockets: &P,
    id: &P::Id,
    port: u32,
    timeout: Duration,
) -> Result<(), ProtocolError> {
    let exchange = async {
        let mut conn = sockets.dial(id, port).await?;
        if !read_signature(&mut conn).await? {
            return Err(ProtocolError::SignatureMismatch);
        }
        conn.write_all(READY_SIGNAL).await?;
        conn.shutdown().await?;

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await?;
        Ok(())
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProtocolError::HandshakeFailed(format!("no answer from VM {}", id)))??;

    debug!("handshake: signalled ready to VM {}", id);
    Ok(())
}

/// Observes the ready marker received by a [`Responder`]
#[derive(Debug, Clone)]
pub struct ReadyWatch {
    rx: watch::Receiver<bool>,
}

impl ReadyWatch {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait up to `timeout` for the host. Returns whether it signalled ready.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        matches!(
            tokio::time::timeout(timeout, self.rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }
}

/// Guest side of the handshake
pub struct Responder {
    listener: Listener,
    ready: Arc<watch::Sender<bool>>,
}

impl Responder {
    pub fn new(listener: Listener) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            listener,
            ready: Arc::new(ready),
        }
    }

    pub fn ready(&self) -> ReadyWatch {
        ReadyWatch {
            rx: self.ready.subscribe(),
        }
    }

    /// Answer handshake connections until `shutdown` fires
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<(), ProtocolError> {
        info!("handshake responder listening on {}", self.listener.describe());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("handshake responder: shutting down");
                    return Ok(());
                }
                res = self.listener.accept() => match res {
                    Ok((conn, peer)) => {
                        trace!("handshake responder: connection from {}", peer);
                        let ready = self.ready.clone();
                        tokio::spawn(async move {
                            if let Err(e) = answer(conn, &ready).await {
                                debug!("handshake responder: {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("handshake responder: accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn answer(mut conn: BoxedStream, ready: &watch::Sender<bool>) -> io::Result<()> {
    conn.write_all(SIGNATURE_PHRASE).await?;
    conn.flush().await?;

    let mut buf = vec![0u8; READY_SIGNAL.len()];
    match tokio::time::timeout(RESPONDER_READ_TIMEOUT, conn.read_exact(&mut buf)).await {
        Ok(Ok(_)) if buf == READY_SIGNAL => {
            if !ready.send_replace(true) {
                info!("handshake responder: host signalled ready");
            }
        }
        Ok(Ok(_)) => warn!("handshake responder: unexpected ready marker"),
        // The host read the signature and hung up: a discovery probe
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => debug!("handshake responder: timed out waiting for ready marker"),
    }
    Ok(())
}
