//! Process-wide shutdown signalling and in-flight task tracking
//!
//! The entry point owns a [`Shutdown`] and hands [`ShutdownSignal`]s to every
//! long-running component. Components tie their accept loops to the signal
//! and stop accepting once it fires.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::info;

/// Owner side of the shutdown token
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown token
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Hand out a signal observing this token
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            _owner: None,
        }
    }

    /// Trigger shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the shutdown token
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
    _owner: Option<Arc<watch::Sender<bool>>>,
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _owner: Some(Arc::new(tx)),
        }
    }

    /// Whether shutdown has been triggered
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is triggered.
    ///
    /// Returns immediately if it already was. If the owning [`Shutdown`] is
    /// dropped without triggering, this also resolves.
    pub async fn recv(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

/// Wait for SIGINT (Ctrl-C) or, on unix, SIGTERM
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("Received interrupt signal");
            }
            _ = term.recv() => {
                info!("Received terminate signal");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received interrupt signal");
        Ok(())
    }
}

/// Tracks in-flight tasks; [`WaitGroup::wait`] resolves when all guards are gone
#[derive(Debug)]
pub struct WaitGroup {
    tx: Mutex<Option<mpsc::Sender<()>>>,
    rx: AsyncMutex<mpsc::Receiver<()>>,
}

/// Held by a tracked task for as long as it runs
#[derive(Debug, Clone)]
pub struct WaitGuard {
    _tx: mpsc::Sender<()>,
}

impl WaitGroup {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
        }
    }

    /// Register a new task. Returns `None` once the group was closed.
    pub fn guard(&self) -> Option<WaitGuard> {
        self.tx.lock().as_ref().map(|tx| WaitGuard { _tx: tx.clone() })
    }

    /// Stop handing out guards
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Close the group and wait for every outstanding guard to be dropped
    pub async fn wait(&self) {
        self.close();
        // Nothing is ever sent; recv returns None once every sender is gone.
        let _ = self.rx.lock().await.recv().await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_late_subscriber_sees_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut signal = shutdown.subscribe();
        assert!(signal.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), signal.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let mut signal = ShutdownSignal::never();
        let res = tokio::time::timeout(Duration::from_millis(50), signal.recv()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_wait_group_waits_for_guards() {
        let wg = WaitGroup::new();
        let guard = wg.guard().unwrap();

        let started = std::time::Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(guard);
        });

        tokio::time::timeout(Duration::from_secs(2), wg.wait())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(wg.guard().is_none());

        // A second wait returns at once
        tokio::time::timeout(Duration::from_millis(100), wg.wait())
            .await
            .unwrap();
    }
}
