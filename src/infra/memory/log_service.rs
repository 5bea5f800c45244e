use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::crypto::{merkle, rfc6962_leaf_hash, Hash256, SignatureVerifier, SigningKeyPair};
use crate::domain::{
    ConsistencyProof, DirectoryId, InclusionProof, LogRoot, LogRootResponse,
};
use crate::infra::{LogService, Result, SequencerError};

use super::now_millis;

#[derive(Default)]
struct LogTree {
    leaves: Vec<Vec<u8>>,
    hashes: Vec<Hash256>,
    /// Sequenced leaves waiting for their index to become the tree head
    pending: BTreeMap<u64, Vec<u8>>,
}

impl LogTree {
    fn integrate(&mut self) {
        while let Some(data) = self.pending.remove(&(self.leaves.len() as u64)) {
            self.hashes.push(rfc6962_leaf_hash(&data));
            self.leaves.push(data);
        }
    }
}

/// Append-only log held in memory.
///
/// Integration is synchronous unless paused, which lets tests observe the
/// queued-but-not-integrated window.
pub struct InMemoryLogService {
    key: SigningKeyPair,
    trees: RwLock<HashMap<DirectoryId, LogTree>>,
    paused: AtomicBool,
}

impl InMemoryLogService {
    pub fn new(key: SigningKeyPair) -> Self {
        Self {
            key,
            trees: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
        }
    }

    pub fn verifier(&self) -> SignatureVerifier {
        self.key.verifier()
    }

    /// Provision an empty log for a directory; no-op if it exists
    pub async fn create_directory(&self, directory_id: &DirectoryId) {
        self.trees
            .write()
            .await
            .entry(directory_id.clone())
            .or_default();
    }

    /// Hold queued leaves instead of integrating them
    pub fn pause_integration(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Integrate everything queued so far and resume normal operation
    pub async fn resume_integration(&self) {
        self.paused.store(false, Ordering::SeqCst);
        for tree in self.trees.write().await.values_mut() {
            tree.integrate();
        }
    }

    /// Number of integrated leaves
    pub async fn size(&self, directory_id: &DirectoryId) -> u64 {
        self.trees
            .read()
            .await
            .get(directory_id)
            .map(|t| t.leaves.len() as u64)
            .unwrap_or(0)
    }

    /// Copy of every integrated leaf, in index order
    pub async fn leaves(&self, directory_id: &DirectoryId) -> Vec<Vec<u8>> {
        self.trees
            .read()
            .await
            .get(directory_id)
            .map(|t| t.leaves.clone())
            .unwrap_or_default()
    }
}

fn not_found(directory_id: &DirectoryId) -> SequencerError {
    SequencerError::DirectoryNotFound(directory_id.clone())
}

#[async_trait]
impl LogService for InMemoryLogService {
    async fn get_latest_root(
        &self,
        directory_id: &DirectoryId,
        first_tree_size: u64,
    ) -> Result<LogRootResponse> {
        let trees = self.trees.read().await;
        let tree = trees.get(directory_id).ok_or_else(|| not_found(directory_id))?;
        let size = tree.hashes.len() as u64;

        let hashes = usize::try_from(first_tree_size)
            .ok()
            .and_then(|first| merkle::consistency_proof(&tree.hashes, first))
            .ok_or_else(|| {
                SequencerError::InvalidArgument(format!(
                    "first tree size {first_tree_size} exceeds log size {size}"
                ))
            })?;

        let root = self.key.sign_log_root(LogRoot {
            directory_id: directory_id.clone(),
            tree_size: size,
            root_hash: merkle::root_hash(&tree.hashes),
            timestamp_millis: now_millis(),
        });

        Ok(LogRootResponse {
            root,
            consistency: ConsistencyProof {
                first_size: first_tree_size,
                second_size: size,
                hashes,
            },
        })
    }

    async fn add_sequenced_leaf(
        &self,
        directory_id: &DirectoryId,
        data: Vec<u8>,
        index: u64,
    ) -> Result<()> {
        let mut trees = self.trees.write().await;
        let tree = trees
            .get_mut(directory_id)
            .ok_or_else(|| not_found(directory_id))?;

        let existing = usize::try_from(index)
            .ok()
            .and_then(|i| tree.leaves.get(i))
            .or_else(|| tree.pending.get(&index));
        match existing {
            Some(stored) if *stored == data => return Ok(()),
            Some(_) => return Err(SequencerError::LeafConflict { index }),
            None => {}
        }

        tree.pending.insert(index, data);
        if !self.paused.load(Ordering::SeqCst) {
            tree.integrate();
        }
        Ok(())
    }

    async fn get_leaf(&self, directory_id: &DirectoryId, index: u64) -> Result<Option<Vec<u8>>> {
        let trees = self.trees.read().await;
        let tree = trees.get(directory_id).ok_or_else(|| not_found(directory_id))?;
        Ok(usize::try_from(index)
            .ok()
            .and_then(|i| tree.leaves.get(i))
            .cloned())
    }

    async fn get_inclusion_proof(
        &self,
        directory_id: &DirectoryId,
        index: u64,
        tree_size: u64,
    ) -> Result<InclusionProof> {
        let trees = self.trees.read().await;
        let tree = trees.get(directory_id).ok_or_else(|| not_found(directory_id))?;

        let hashes = usize::try_from(tree_size)
            .ok()
            .filter(|size| *size <= tree.hashes.len())
            .and_then(|size| {
                let idx = usize::try_from(index).ok()?;
                merkle::inclusion_proof(&tree.hashes[..size], idx)
            })
            .ok_or_else(|| {
                SequencerError::InvalidArgument(format!(
                    "no leaf {index} in a tree of size {tree_size}"
                ))
            })?;

        Ok(InclusionProof {
            leaf_index: index,
            tree_size,
            hashes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequenced_leaves_integrate_in_order() {
        let log = InMemoryLogService::new(SigningKeyPair::generate());
        let dir = DirectoryId::new("d");
        log.create_directory(&dir).await;

        log.add_sequenced_leaf(&dir, b"one".to_vec(), 1).await.unwrap();
        assert_eq!(log.size(&dir).await, 0);
        log.add_sequenced_leaf(&dir, b"zero".to_vec(), 0).await.unwrap();
        assert_eq!(log.size(&dir).await, 2);
    }

    #[tokio::test]
    async fn test_re_adding_leaf() {
        let log = InMemoryLogService::new(SigningKeyPair::generate());
        let dir = DirectoryId::new("d");
        log.create_directory(&dir).await;

        log.add_sequenced_leaf(&dir, b"a".to_vec(), 0).await.unwrap();
        log.add_sequenced_leaf(&dir, b"a".to_vec(), 0).await.unwrap();
        assert_eq!(log.size(&dir).await, 1);
        assert!(matches!(
            log.add_sequenced_leaf(&dir, b"b".to_vec(), 0).await,
            Err(SequencerError::LeafConflict { index: 0 })
        ));
    }

    #[tokio::test]
    async fn test_paused_integration() {
        let log = InMemoryLogService::new(SigningKeyPair::generate());
        let dir = DirectoryId::new("d");
        log.create_directory(&dir).await;
        log.pause_integration();
        log.add_sequenced_leaf(&dir, b"a".to_vec(), 0).await.unwrap();
        assert_eq!(log.size(&dir).await, 0);
        log.resume_integration().await;
        assert_eq!(log.size(&dir).await, 1);
    }

    #[tokio::test]
    async fn test_roots_and_proofs_verify() {
        let log = InMemoryLogService::new(SigningKeyPair::generate());
        let dir = DirectoryId::new("d");
        log.create_directory(&dir).await;
        for i in 0..3u64 {
            log.add_sequenced_leaf(&dir, vec![i as u8], i).await.unwrap();
        }
        let first = log.get_latest_root(&dir, 0).await.unwrap();
        for i in 3..7u64 {
            log.add_sequenced_leaf(&dir, vec![i as u8], i).await.unwrap();
        }
        let second = log.get_latest_root(&dir, 3).await.unwrap();
        assert!(log.verifier().verify_log_root(&second.root).is_ok());
        assert!(merkle::verify_consistency(
            3,
            7,
            &first.root.root.root_hash,
            &second.root.root.root_hash,
            &second.consistency.hashes
        ));

        let proof = log.get_inclusion_proof(&dir, 4, 7).await.unwrap();
        assert!(merkle::verify_inclusion(
            &rfc6962_leaf_hash(&[4]),
            4,
            7,
            &proof.hashes,
            &second.root.root.root_hash
        ));
        assert!(log.get_inclusion_proof(&dir, 7, 7).await.is_err());
        assert!(log.get_latest_root(&dir, 8).await.is_err());
    }
}
