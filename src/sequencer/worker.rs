//! Periodic sequencer driver
//!
//! Runs `run_batch` for every configured directory on each tick. Directories
//! are processed concurrently; a failure in one is logged and does not affect
//! the others. Failed steps are retried from scratch on the next tick.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{Sequencer, StepOutcome};
use crate::domain::DirectoryId;
use crate::infra::{ErrorClass, ShutdownSignal};

/// Control messages for a running worker
#[derive(Debug)]
pub enum WorkerMessage {
    /// Run one pass for a directory immediately
    RunNow { directory_id: DirectoryId },
    /// Stop the worker
    Shutdown,
}

/// Background task driving the sequencer
pub struct SequencerWorker {
    sequencer: Arc<Sequencer>,
    shutdown: ShutdownSignal,
    control_tx: mpsc::Sender<WorkerMessage>,
    control_rx: mpsc::Receiver<WorkerMessage>,
}

impl SequencerWorker {
    pub fn new(sequencer: Arc<Sequencer>, shutdown: ShutdownSignal) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            sequencer,
            shutdown,
            control_tx,
            control_rx,
        }
    }

    /// Sender handle for controlling the worker
    pub fn control_handle(&self) -> mpsc::Sender<WorkerMessage> {
        self.control_tx.clone()
    }

    pub async fn run(mut self) {
        let config = self.sequencer.config().clone();
        info!(
            interval_ms = config.batch_interval.as_millis() as u64,
            min_batch = config.min_batch,
            max_batch = config.max_batch,
            directories = config.directories.len(),
            "Starting sequencer worker"
        );

        let mut ticker = interval(config.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Sequencer worker stopping on shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_pass(&config.directories).await;
                }
                Some(msg) = self.control_rx.recv() => {
                    match msg {
                        WorkerMessage::RunNow { directory_id } => {
                            info!(directory_id = %directory_id, "Forced sequencer pass");
                            self.run_directory(&directory_id).await;
                        }
                        WorkerMessage::Shutdown => {
                            info!("Sequencer worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// One tick over all directories
    pub async fn run_pass(&self, directories: &[DirectoryId]) {
        debug!(directories = directories.len(), "Sequencer pass");
        join_all(directories.iter().map(|d| self.run_directory(d))).await;
    }

    async fn run_directory(&self, directory_id: &DirectoryId) {
        let config = self.sequencer.config();
        match self
            .sequencer
            .run_batch(directory_id, config.min_batch, config.max_batch)
            .await
        {
            Ok(steps) => {
                if let Some(StepOutcome::NoOp { .. }) = steps.first() {
                    // Earlier revisions may still be unpublished after a failed publish.
                    if let Err(e) = self.sequencer.publish_batch(directory_id).await {
                        warn!(directory_id = %directory_id, error = %e, "Publish retry failed");
                    }
                } else {
                    debug!(directory_id = %directory_id, steps = steps.len(), "Sequencer pass done");
                }
            }
            Err(e) => match e.class() {
                ErrorClass::Integrity | ErrorClass::Verification | ErrorClass::Internal => {
                    error!(directory_id = %directory_id, error = %e, "Sequencer pass failed, needs attention")
                }
                _ => warn!(directory_id = %directory_id, error = %e, "Sequencer pass failed"),
            },
        }
    }
}

/// Spawn the worker as a background task
pub fn spawn_sequencer_worker(
    sequencer: Arc<Sequencer>,
    shutdown: ShutdownSignal,
) -> (tokio::task::JoinHandle<()>, mpsc::Sender<WorkerMessage>) {
    let worker = SequencerWorker::new(sequencer, shutdown);
    let control_handle = worker.control_handle();
    let handle = tokio::spawn(worker.run());
    (handle, control_handle)
}
