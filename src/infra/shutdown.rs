//! Shutdown and cancellation
//!
//! A `ShutdownCoordinator` owns the trigger; `ShutdownSignal` clones are
//! handed to the HTTP server, the sequencer worker and every long-running
//! sequencer call, which abort with `SequencerError::Cancelled` once it fires.

use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

/// Cloneable view of the shutdown state
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_shutdown(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Complete once shutdown has been triggered
    pub async fn cancelled(&self) {
        match &self.rx {
            Some(rx) => {
                let mut rx = rx.clone();
                // A dropped coordinator counts as shutdown.
                let _ = rx.wait_for(|fired| *fired).await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Owner of the shutdown trigger
#[derive(Debug)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Trigger shutdown; idempotent
    pub fn shutdown(&self) {
        if !self.tx.send_replace(true) {
            info!("Initiating graceful shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete on Ctrl+C or SIGTERM
pub async fn os_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

/// Shutdown timing for the HTTP server
#[derive(Debug, Clone)]
pub struct GracefulShutdownConfig {
    /// Upper bound on waiting for background tasks after the server stops
    pub drain_timeout: Duration,
    /// Delay between the signal and closing the listener
    pub shutdown_delay: Duration,
}

impl Default for GracefulShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            shutdown_delay: Duration::from_secs(1),
        }
    }
}
