//! Verifying client for the root-publication log

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::crypto::{merkle, rfc6962_leaf_hash, SignatureVerifier};
use crate::domain::{DirectoryId, SignedLogRoot};
use crate::infra::{LogService, Result, RetryConfig, SequencerError, ShutdownSignal};

/// Wraps a `LogService`, checking every root it returns.
///
/// Keeps the last verified root per directory; each new root must carry a
/// valid signature and a consistency proof from that trusted root.
pub struct VerifyingLogClient {
    service: Arc<dyn LogService>,
    verifier: SignatureVerifier,
    trusted: Mutex<HashMap<DirectoryId, SignedLogRoot>>,
    poll: RetryConfig,
}

impl VerifyingLogClient {
    pub fn new(service: Arc<dyn LogService>, verifier: SignatureVerifier) -> Self {
        Self {
            service,
            verifier,
            trusted: Mutex::new(HashMap::new()),
            poll: RetryConfig::inclusion_poll(),
        }
    }

    /// Override the backoff used while waiting for inclusion
    pub fn with_poll_config(mut self, poll: RetryConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Last root this client verified for a directory
    pub async fn trusted_root(&self, directory_id: &DirectoryId) -> Option<SignedLogRoot> {
        self.trusted.lock().await.get(directory_id).cloned()
    }

    /// Fetch the latest log root and verify it against the trusted root
    #[instrument(skip(self), fields(directory_id = %directory_id))]
    pub async fn get_and_verify_latest_root(
        &self,
        directory_id: &DirectoryId,
    ) -> Result<SignedLogRoot> {
        let trusted = self.trusted_root(directory_id).await;
        let first_size = trusted.as_ref().map(|t| t.tree_size()).unwrap_or(0);

        let response = self.service.get_latest_root(directory_id, first_size).await?;
        let root = response.root;

        self.verifier
            .verify_log_root(&root)
            .map_err(|e| SequencerError::Verification(format!("log root signature: {e}")))?;
        if root.root.directory_id != *directory_id {
            return Err(SequencerError::Verification(format!(
                "log root is for directory {}, expected {directory_id}",
                root.root.directory_id
            )));
        }

        if let Some(trusted) = &trusted {
            let proof = &response.consistency;
            if root.tree_size() < trusted.tree_size() {
                return Err(SequencerError::Verification(format!(
                    "log shrank from {} to {}",
                    trusted.tree_size(),
                    root.tree_size()
                )));
            }
            let consistent = proof.first_size == trusted.tree_size()
                && proof.second_size == root.tree_size()
                && merkle::verify_consistency(
                    trusted.tree_size(),
                    root.tree_size(),
                    &trusted.root.root_hash,
                    &root.root.root_hash,
                    &proof.hashes,
                );
            if !consistent {
                return Err(SequencerError::Verification(format!(
                    "log root at size {} is not consistent with trusted size {}",
                    root.tree_size(),
                    trusted.tree_size()
                )));
            }
        }

        let mut guard = self.trusted.lock().await;
        // A concurrent caller may have advanced the trusted root meanwhile;
        // never move it backwards.
        let advance = guard
            .get(directory_id)
            .map(|t| t.tree_size() <= root.tree_size())
            .unwrap_or(true);
        if advance {
            guard.insert(directory_id.clone(), root.clone());
        }
        Ok(root)
    }

    /// Queue `data` at `index` in the log
    pub async fn add_sequenced_leaf(
        &self,
        directory_id: &DirectoryId,
        data: Vec<u8>,
        index: u64,
    ) -> Result<()> {
        self.service.add_sequenced_leaf(directory_id, data, index).await
    }

    /// Verify that `data` sits at `index` in the tree committed to by `root`
    pub async fn verify_inclusion(
        &self,
        directory_id: &DirectoryId,
        data: &[u8],
        index: u64,
        root: &SignedLogRoot,
    ) -> Result<()> {
        let proof = self
            .service
            .get_inclusion_proof(directory_id, index, root.tree_size())
            .await?;
        let ok = proof.leaf_index == index
            && proof.tree_size == root.tree_size()
            && merkle::verify_inclusion(
                &rfc6962_leaf_hash(data),
                index,
                root.tree_size(),
                &proof.hashes,
                &root.root.root_hash,
            );
        if ok {
            Ok(())
        } else {
            Err(SequencerError::Verification(format!(
                "inclusion proof for log leaf {index} does not match root at size {}",
                root.tree_size()
            )))
        }
    }

    /// Leaf data at `index` under a verified root, or `None` if the log is
    /// not that long yet
    pub async fn get_verified_leaf(
        &self,
        directory_id: &DirectoryId,
        index: u64,
        root: &SignedLogRoot,
    ) -> Result<Option<Vec<u8>>> {
        if index >= root.tree_size() {
            return Ok(None);
        }
        let data = self
            .service
            .get_leaf(directory_id, index)
            .await?
            .ok_or_else(|| {
                SequencerError::Verification(format!(
                    "log claims size {} but has no leaf {index}",
                    root.tree_size()
                ))
            })?;
        self.verify_inclusion(directory_id, &data, index, root).await?;
        Ok(Some(data))
    }

    /// Poll until `data` is integrated at `index`, verifying the inclusion
    /// proof.
    ///
    /// Honors `shutdown` (`Cancelled`) and `timeout` (`DeadlineExceeded`).
    /// Leaves already queued stay queued when the wait is abandoned.
    #[instrument(skip(self, data, shutdown), fields(directory_id = %directory_id))]
    pub async fn wait_for_inclusion(
        &self,
        directory_id: &DirectoryId,
        data: &[u8],
        index: u64,
        shutdown: &ShutdownSignal,
        timeout: Duration,
    ) -> Result<SignedLogRoot> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;

        loop {
            if shutdown.is_shutdown() {
                return Err(SequencerError::Cancelled);
            }

            let root = self.get_and_verify_latest_root(directory_id).await?;
            if root.tree_size() > index {
                let stored = self
                    .get_verified_leaf(directory_id, index, &root)
                    .await?
                    .unwrap_or_default();
                if stored != data {
                    return Err(SequencerError::LeafConflict { index });
                }
                return Ok(root);
            }

            let delay = self.poll.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                tree_size = root.tree_size(),
                delay_ms = delay.as_millis() as u64,
                "Leaf not yet integrated"
            );

            let wake = (Instant::now() + delay).min(deadline);
            tokio::select! {
                _ = shutdown.cancelled() => return Err(SequencerError::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
            if Instant::now() >= deadline {
                return Err(SequencerError::DeadlineExceeded(format!(
                    "log leaf {index} not integrated within {timeout:?}"
                )));
            }
        }
    }
}
