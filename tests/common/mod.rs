//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use keytrans_sequencer::clients::{VerifyingLogClient, VerifyingMapClient};
use keytrans_sequencer::crypto::{sha256, SignatureVerifier, SigningKeyPair};
use keytrans_sequencer::domain::{MapLeafProof, MapLeavesResponse};
use keytrans_sequencer::infra::{
    InMemoryBatchStore, InMemoryLogService, InMemoryMapService, InMemoryMutationLog, RetryConfig,
    ShutdownSignal,
};
use keytrans_sequencer::{
    DirectoryId, LogId, MapIndex, MapLeaf, MapMetadata, MapService, MutationQueue, Result,
    Sequencer, SequencerConfig, SignedEntry, SignedMapRoot, VersionedEntryResolver,
};

/// Directory used by every test
pub fn dir() -> DirectoryId {
    DirectoryId::new("accounts")
}

/// A user that signs its own entry updates with a fixed key
pub struct User {
    pub name: &'static str,
    pub key: SigningKeyPair,
}

impl User {
    pub fn new(name: &'static str, seed: u8) -> Self {
        Self {
            name,
            key: SigningKeyPair::from_bytes(&[seed; 32]),
        }
    }

    pub fn index(&self) -> MapIndex {
        MapIndex::from_bytes(sha256(self.name.as_bytes()))
    }

    pub fn entry(&self, version: u64, public_key: &str) -> SignedEntry {
        self.key
            .sign_entry(self.index(), self.name, version, vec![public_key.to_string()])
    }
}

pub fn alice() -> User {
    User::new("alice", 1)
}

pub fn bob() -> User {
    User::new("bob", 2)
}

pub fn carol() -> User {
    User::new("carol", 3)
}

/// Map service wrapper that can corrupt the leaves it serves
pub struct TamperingMapService {
    inner: Arc<InMemoryMapService>,
    corrupt_leaves: AtomicBool,
}

impl TamperingMapService {
    pub fn new(inner: Arc<InMemoryMapService>) -> Self {
        Self {
            inner,
            corrupt_leaves: AtomicBool::new(false),
        }
    }

    pub fn corrupt_leaves(&self, on: bool) {
        self.corrupt_leaves.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl MapService for TamperingMapService {
    async fn get_latest_root(&self, directory_id: &DirectoryId) -> Result<SignedMapRoot> {
        self.inner.get_latest_root(directory_id).await
    }

    async fn get_root_at_revision(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
    ) -> Result<SignedMapRoot> {
        self.inner.get_root_at_revision(directory_id, revision).await
    }

    async fn get_leaves(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        indices: &[MapIndex],
    ) -> Result<MapLeavesResponse> {
        let mut response = self.inner.get_leaves(directory_id, revision, indices).await?;
        if self.corrupt_leaves.load(Ordering::SeqCst) {
            for proof in &mut response.proofs {
                if let MapLeafProof::Present { leaf, .. } = proof {
                    leaf.leaf_value.push(b' ');
                }
            }
        }
        Ok(response)
    }

    async fn set_leaves(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        leaves: Vec<MapLeaf>,
        metadata: MapMetadata,
    ) -> Result<SignedMapRoot> {
        self.inner
            .set_leaves(directory_id, revision, leaves, metadata)
            .await
    }
}

/// In-memory backends wired to a sequencer
pub struct Harness {
    pub queue: Arc<InMemoryMutationLog>,
    pub batches: Arc<InMemoryBatchStore>,
    pub map_service: Arc<InMemoryMapService>,
    pub tamper: Arc<TamperingMapService>,
    pub log_service: Arc<InMemoryLogService>,
    pub map: Arc<VerifyingMapClient>,
    pub log: Arc<VerifyingLogClient>,
    pub sequencer: Arc<Sequencer>,
}

/// Test configuration: short publish timeout, small pages
pub fn test_config() -> SequencerConfig {
    SequencerConfig::default()
        .with_directories(vec![dir()])
        .with_page_size(2)
        .with_publish_timeout(Duration::from_secs(2))
}

impl Harness {
    /// Directory provisioned with writable logs 1 and 2
    pub async fn new() -> Self {
        let queue = Arc::new(InMemoryMutationLog::new());
        queue.create_log(&dir(), LogId(1)).await;
        queue.create_log(&dir(), LogId(2)).await;

        let map_service = Arc::new(InMemoryMapService::new(SigningKeyPair::generate()));
        map_service.create_directory(&dir()).await;
        let tamper = Arc::new(TamperingMapService::new(map_service.clone()));

        let log_service = Arc::new(InMemoryLogService::new(SigningKeyPair::generate()));
        log_service.create_directory(&dir()).await;

        let log = Arc::new(
            VerifyingLogClient::new(log_service.clone(), log_service.verifier())
                .with_poll_config(RetryConfig::fast()),
        );
        let map = Arc::new(
            VerifyingMapClient::new(tamper.clone(), map_service.verifier()).with_log(log.clone()),
        );

        let batches = Arc::new(InMemoryBatchStore::new());
        let sequencer = Arc::new(Sequencer::new(
            test_config(),
            queue.clone(),
            batches.clone(),
            map.clone(),
            log.clone(),
            Arc::new(VersionedEntryResolver::new()),
        ));

        Self {
            queue,
            batches,
            map_service,
            tamper,
            log_service,
            map,
            log,
            sequencer,
        }
    }

    /// Another sequencer over the same backends and clients
    pub fn sequencer_with(&self, config: SequencerConfig, shutdown: ShutdownSignal) -> Sequencer {
        Sequencer::new(
            config,
            self.queue.clone(),
            self.batches.clone(),
            self.map.clone(),
            self.log.clone(),
            Arc::new(VersionedEntryResolver::new()),
        )
        .with_shutdown(shutdown)
    }

    /// A sequencer whose map client trusts a different key
    pub fn sequencer_trusting(&self, map_verifier: SignatureVerifier) -> Sequencer {
        let map = Arc::new(
            VerifyingMapClient::new(self.tamper.clone(), map_verifier).with_log(self.log.clone()),
        );
        Sequencer::new(
            test_config(),
            self.queue.clone(),
            self.batches.clone(),
            map,
            self.log.clone(),
            Arc::new(VersionedEntryResolver::new()),
        )
    }

    pub async fn enqueue(&self, log_id: i64, entry: &SignedEntry) -> u64 {
        self.queue
            .send(&dir(), LogId(log_id), entry.to_bytes())
            .await
            .unwrap()
    }

    pub async fn enqueue_raw(&self, log_id: i64, payload: &[u8]) -> u64 {
        self.queue
            .send(&dir(), LogId(log_id), payload.to_vec())
            .await
            .unwrap()
    }

    pub async fn latest_revision(&self) -> u64 {
        self.map
            .get_and_verify_latest_map_root(&dir())
            .await
            .unwrap()
            .revision()
    }

    /// Verified entry stored for `user` at `revision`
    pub async fn entry_at(&self, revision: u64, user: &User) -> Option<SignedEntry> {
        let mut leaves = self
            .map
            .get_and_verify_leaves(&dir(), revision, &[user.index()])
            .await
            .unwrap();
        leaves
            .remove(&user.index())
            .and_then(|mut found| found.pop())
            .map(|leaf| SignedEntry::from_bytes(&leaf.leaf_value).unwrap())
    }

    /// Every leaf at `revision` keyed by index, for whole-map comparisons
    pub async fn leaves_at(
        &self,
        revision: u64,
        users: &[&User],
    ) -> BTreeMap<MapIndex, Vec<MapLeaf>> {
        let indices: Vec<MapIndex> = users.iter().map(|u| u.index()).collect();
        self.map
            .get_and_verify_leaves(&dir(), revision, &indices)
            .await
            .unwrap()
    }

    /// Map roots published to the root log, decoded
    pub async fn published_roots(&self) -> Vec<SignedMapRoot> {
        self.log_service
            .leaves(&dir())
            .await
            .iter()
            .map(|leaf| SignedMapRoot::from_log_leaf(leaf).unwrap())
            .collect()
    }
}
