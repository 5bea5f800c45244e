use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::crypto::{map_leaf_hash, merkle, sha256, Hash256, SignatureVerifier, SigningKeyPair};
use crate::domain::{
    DirectoryId, MapIndex, MapLeaf, MapLeafProof, MapLeavesResponse, MapMetadata, MapRoot,
    NeighborProof, SignedMapRoot,
};
use crate::infra::{MapService, Result, SequencerError};

use super::now_millis;

struct Revision {
    leaves: Arc<BTreeMap<MapIndex, MapLeaf>>,
    root: SignedMapRoot,
}

/// Versioned map held in memory. Every revision keeps a full snapshot.
pub struct InMemoryMapService {
    key: SigningKeyPair,
    directories: RwLock<HashMap<DirectoryId, Vec<Revision>>>,
}

impl InMemoryMapService {
    pub fn new(key: SigningKeyPair) -> Self {
        Self {
            key,
            directories: RwLock::new(HashMap::new()),
        }
    }

    /// Verifier for this service's root signatures
    pub fn verifier(&self) -> SignatureVerifier {
        self.key.verifier()
    }

    /// Provision a directory at revision 0 (the empty map); no-op if it exists
    pub async fn create_directory(&self, directory_id: &DirectoryId) {
        let mut directories = self.directories.write().await;
        if directories.contains_key(directory_id) {
            return;
        }
        let leaves = Arc::new(BTreeMap::new());
        let root = self.sign(directory_id, 0, &leaves, MapMetadata::empty(0));
        directories.insert(directory_id.clone(), vec![Revision { leaves, root }]);
    }

    fn sign(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        leaves: &BTreeMap<MapIndex, MapLeaf>,
        metadata: MapMetadata,
    ) -> SignedMapRoot {
        let hashes = leaf_hashes(leaves);
        self.key.sign_map_root(MapRoot {
            directory_id: directory_id.clone(),
            revision,
            leaf_count: hashes.len() as u64,
            root_hash: merkle::root_hash(&hashes),
            timestamp_millis: now_millis(),
            metadata,
        })
    }
}

fn leaf_hashes(leaves: &BTreeMap<MapIndex, MapLeaf>) -> Vec<Hash256> {
    leaves
        .values()
        .map(|l| map_leaf_hash(l.index.as_bytes(), &l.leaf_value, &l.extra_data))
        .collect()
}

fn neighbor(leaves: &[&MapLeaf], hashes: &[Hash256], position: usize) -> Option<NeighborProof> {
    let leaf = leaves.get(position)?;
    Some(NeighborProof {
        index: leaf.index,
        value_hash: sha256(&leaf.leaf_value),
        extra_hash: sha256(&leaf.extra_data),
        position: position as u64,
        path: merkle::inclusion_proof(hashes, position)?,
    })
}

fn prove(leaves: &BTreeMap<MapIndex, MapLeaf>, indices: &[MapIndex]) -> Vec<MapLeafProof> {
    let ordered: Vec<&MapLeaf> = leaves.values().collect();
    let hashes = leaf_hashes(leaves);

    indices
        .iter()
        .map(
            |index| match ordered.binary_search_by(|l| l.index.cmp(index)) {
                Ok(position) => MapLeafProof::Present {
                    leaf: ordered[position].clone(),
                    position: position as u64,
                    path: merkle::inclusion_proof(&hashes, position).unwrap_or_default(),
                },
                Err(position) => MapLeafProof::Absent {
                    index: *index,
                    left: position
                        .checked_sub(1)
                        .and_then(|p| neighbor(&ordered, &hashes, p)),
                    right: neighbor(&ordered, &hashes, position),
                },
            },
        )
        .collect()
}

#[async_trait]
impl MapService for InMemoryMapService {
    async fn get_latest_root(&self, directory_id: &DirectoryId) -> Result<SignedMapRoot> {
        let directories = self.directories.read().await;
        directories
            .get(directory_id)
            .and_then(|revs| revs.last())
            .map(|r| r.root.clone())
            .ok_or_else(|| SequencerError::DirectoryNotFound(directory_id.clone()))
    }

    async fn get_root_at_revision(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
    ) -> Result<SignedMapRoot> {
        let directories = self.directories.read().await;
        let revs = directories
            .get(directory_id)
            .ok_or_else(|| SequencerError::DirectoryNotFound(directory_id.clone()))?;
        usize::try_from(revision)
            .ok()
            .and_then(|r| revs.get(r))
            .map(|r| r.root.clone())
            .ok_or_else(|| SequencerError::RevisionNotFound {
                directory_id: directory_id.clone(),
                revision,
            })
    }

    async fn get_leaves(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        indices: &[MapIndex],
    ) -> Result<MapLeavesResponse> {
        let (leaves, root) = {
            let directories = self.directories.read().await;
            let revs = directories
                .get(directory_id)
                .ok_or_else(|| SequencerError::DirectoryNotFound(directory_id.clone()))?;
            let rev = usize::try_from(revision)
                .ok()
                .and_then(|r| revs.get(r))
                .ok_or_else(|| SequencerError::RevisionNotFound {
                    directory_id: directory_id.clone(),
                    revision,
                })?;
            (rev.leaves.clone(), rev.root.clone())
        };

        Ok(MapLeavesResponse {
            root,
            proofs: prove(&leaves, indices),
        })
    }

    #[instrument(skip(self, leaves, metadata), fields(directory_id = %directory_id, leaves = leaves.len()))]
    async fn set_leaves(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        leaves: Vec<MapLeaf>,
        metadata: MapMetadata,
    ) -> Result<SignedMapRoot> {
        if metadata.revision != revision {
            return Err(SequencerError::InvalidArgument(format!(
                "metadata is for revision {}, not {revision}",
                metadata.revision
            )));
        }

        let mut directories = self.directories.write().await;
        let revs = directories
            .get_mut(directory_id)
            .ok_or_else(|| SequencerError::DirectoryNotFound(directory_id.clone()))?;

        let latest = revs.len() as u64 - 1;
        if revision != latest + 1 {
            return Err(SequencerError::FailedPrecondition(format!(
                "map is at revision {latest}, cannot write revision {revision}"
            )));
        }

        let mut next = revs
            .last()
            .map(|r| r.leaves.as_ref().clone())
            .unwrap_or_default();
        let mut written = std::collections::HashSet::new();
        for leaf in leaves {
            if !written.insert(leaf.index) {
                return Err(SequencerError::InvalidArgument(format!(
                    "index {} written twice in one revision",
                    leaf.index
                )));
            }
            next.insert(leaf.index, leaf);
        }

        let root = self.sign(directory_id, revision, &next, metadata);
        revs.push(Revision {
            leaves: Arc::new(next),
            root: root.clone(),
        });
        Ok(root)
    }
}
