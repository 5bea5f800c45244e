//! Verifying client for the map service

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::instrument;

use crate::crypto::{map_leaf_hash, map_leaf_hash_from_digests, merkle, SignatureVerifier};
use crate::domain::{
    DirectoryId, MapIndex, MapLeaf, MapLeafProof, MapMetadata, MapRoot, NeighborProof,
    SignedMapRoot,
};
use crate::infra::{MapService, Result, SequencerError};

use super::VerifyingLogClient;

/// Wraps a `MapService`, checking every root and leaf proof it returns.
///
/// With a log client attached, roots whose revision is already covered by
/// the root-publication log must also match the published copy.
pub struct VerifyingMapClient {
    service: Arc<dyn MapService>,
    verifier: SignatureVerifier,
    log: Option<Arc<VerifyingLogClient>>,
}

impl VerifyingMapClient {
    pub fn new(service: Arc<dyn MapService>, verifier: SignatureVerifier) -> Self {
        Self {
            service,
            verifier,
            log: None,
        }
    }

    /// Also check map roots against the root-publication log
    pub fn with_log(mut self, log: Arc<VerifyingLogClient>) -> Self {
        self.log = Some(log);
        self
    }

    fn verify_root(&self, directory_id: &DirectoryId, root: &SignedMapRoot) -> Result<()> {
        self.verifier
            .verify_map_root(root)
            .map_err(|e| SequencerError::Verification(format!("map root signature: {e}")))?;
        if root.root.directory_id != *directory_id {
            return Err(SequencerError::Verification(format!(
                "map root is for directory {}, expected {directory_id}",
                root.root.directory_id
            )));
        }
        if root.metadata().revision != root.revision() {
            return Err(SequencerError::Verification(format!(
                "map root {} carries metadata for revision {}",
                root.revision(),
                root.metadata().revision
            )));
        }
        Ok(())
    }

    /// If the log already holds this revision, it must hold exactly this root
    async fn verify_published(&self, directory_id: &DirectoryId, root: &SignedMapRoot) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let log_root = log.get_and_verify_latest_root(directory_id).await?;
        let Some(published) = log
            .get_verified_leaf(directory_id, root.revision(), &log_root)
            .await?
        else {
            return Ok(());
        };
        let published = SignedMapRoot::from_log_leaf(&published).map_err(|e| {
            SequencerError::Verification(format!(
                "log leaf {} is not a map root: {e}",
                root.revision()
            ))
        })?;
        if published != *root {
            return Err(SequencerError::Verification(format!(
                "map root for revision {} differs from the published one",
                root.revision()
            )));
        }
        Ok(())
    }

    /// Latest map root, verified
    #[instrument(skip(self), fields(directory_id = %directory_id))]
    pub async fn get_and_verify_latest_map_root(
        &self,
        directory_id: &DirectoryId,
    ) -> Result<SignedMapRoot> {
        let root = self.service.get_latest_root(directory_id).await?;
        self.verify_root(directory_id, &root)?;
        self.verify_published(directory_id, &root).await?;
        Ok(root)
    }

    /// Map root at a given revision, verified
    #[instrument(skip(self), fields(directory_id = %directory_id))]
    pub async fn get_and_verify_map_root_by_revision(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
    ) -> Result<SignedMapRoot> {
        let root = self.service.get_root_at_revision(directory_id, revision).await?;
        self.verify_root(directory_id, &root)?;
        if root.revision() != revision {
            return Err(SequencerError::Verification(format!(
                "asked for revision {revision}, got {}",
                root.revision()
            )));
        }
        self.verify_published(directory_id, &root).await?;
        Ok(root)
    }

    /// Leaves at `revision`, each proven present or absent under that
    /// revision's root.
    ///
    /// Returns every present leaf per requested index. More than one leaf for
    /// an index is returned as-is so the caller can flag the inconsistency.
    #[instrument(skip(self, indices), fields(directory_id = %directory_id, indices = indices.len()))]
    pub async fn get_and_verify_leaves(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        indices: &[MapIndex],
    ) -> Result<BTreeMap<MapIndex, Vec<MapLeaf>>> {
        let response = self.service.get_leaves(directory_id, revision, indices).await?;
        self.verify_root(directory_id, &response.root)?;
        if response.root.revision() != revision {
            return Err(SequencerError::Verification(format!(
                "leaves requested at revision {revision}, proven against {}",
                response.root.revision()
            )));
        }

        let mut out: BTreeMap<MapIndex, Vec<MapLeaf>> =
            indices.iter().map(|i| (*i, Vec::new())).collect();
        let mut proven = std::collections::BTreeSet::new();
        for proof in response.proofs {
            let index = proof.index();
            let Some(slot) = out.get_mut(&index) else {
                return Err(SequencerError::Verification(format!(
                    "proof for unrequested index {index}"
                )));
            };
            if let Some(leaf) = verify_leaf_proof(&response.root.root, &proof)? {
                slot.push(leaf);
            }
            proven.insert(index);
        }

        if let Some(missing) = indices.iter().find(|i| !proven.contains(*i)) {
            return Err(SequencerError::Verification(format!(
                "no proof returned for index {missing}"
            )));
        }
        Ok(out)
    }

    /// Commit `leaves` as `revision` and verify the returned root
    #[instrument(skip(self, leaves, metadata), fields(directory_id = %directory_id, leaves = leaves.len()))]
    pub async fn set_leaves(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        leaves: Vec<MapLeaf>,
        metadata: MapMetadata,
    ) -> Result<SignedMapRoot> {
        let root = self
            .service
            .set_leaves(directory_id, revision, leaves, metadata.clone())
            .await?;
        self.verify_root(directory_id, &root)?;
        if root.revision() != revision || *root.metadata() != metadata {
            return Err(SequencerError::Verification(format!(
                "map service returned revision {} with different metadata than written",
                root.revision()
            )));
        }
        Ok(root)
    }
}

fn verify_neighbor(root: &MapRoot, neighbor: &NeighborProof) -> bool {
    let hash = map_leaf_hash_from_digests(
        neighbor.index.as_bytes(),
        &neighbor.value_hash,
        &neighbor.extra_hash,
    );
    merkle::verify_inclusion(
        &hash,
        neighbor.position,
        root.leaf_count,
        &neighbor.path,
        &root.root_hash,
    )
}

/// Check one leaf proof against a map root. `Ok(Some)` for a proven leaf,
/// `Ok(None)` for proven absence.
pub fn verify_leaf_proof(root: &MapRoot, proof: &MapLeafProof) -> Result<Option<MapLeaf>> {
    let fail = |what: &str| {
        Err(SequencerError::Verification(format!(
            "{what} for index {} at revision {}",
            proof.index(),
            root.revision
        )))
    };

    match proof {
        MapLeafProof::Present {
            leaf,
            position,
            path,
        } => {
            let hash = map_leaf_hash(leaf.index.as_bytes(), &leaf.leaf_value, &leaf.extra_data);
            if merkle::verify_inclusion(&hash, *position, root.leaf_count, path, &root.root_hash) {
                Ok(Some(leaf.clone()))
            } else {
                fail("bad inclusion proof")
            }
        }
        MapLeafProof::Absent { index, left, right } => {
            let bracketed = match (left, right) {
                (None, None) => root.leaf_count == 0 && root.root_hash == merkle::root_hash(&[]),
                (Some(l), None) => {
                    l.index < *index
                        && l.position + 1 == root.leaf_count
                        && verify_neighbor(root, l)
                }
                (None, Some(r)) => {
                    r.index > *index && r.position == 0 && verify_neighbor(root, r)
                }
                (Some(l), Some(r)) => {
                    l.index < *index
                        && r.index > *index
                        && l.position + 1 == r.position
                        && verify_neighbor(root, l)
                        && verify_neighbor(root, r)
                }
            };
            if bracketed {
                Ok(None)
            } else {
                fail("bad absence proof")
            }
        }
    }
}
