//! Signed map and log roots and the proofs that tie them together

use serde::{Deserialize, Serialize};

use super::types::{hash256_hex, hash256_vec_hex, signature64_hex};
use super::{DirectoryId, Hash256, MapIndex, MapLeaf, MapMetadata, Signature64};

/// Commitment to the full map state at one revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRoot {
    pub directory_id: DirectoryId,
    pub revision: u64,
    /// Number of leaves in the map at this revision
    pub leaf_count: u64,
    #[serde(with = "hash256_hex")]
    pub root_hash: Hash256,
    pub timestamp_millis: u64,
    /// Batch definition this revision was built from
    pub metadata: MapMetadata,
}

/// Map root together with the map service's signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMapRoot {
    pub root: MapRoot,
    #[serde(with = "signature64_hex")]
    pub signature: Signature64,
}

impl SignedMapRoot {
    pub fn revision(&self) -> u64 {
        self.root.revision
    }

    pub fn metadata(&self) -> &MapMetadata {
        &self.root.metadata
    }

    /// Bytes published as the root-log leaf for this revision
    pub fn to_log_leaf(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_log_leaf(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Commitment to the append-only root-publication log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRoot {
    pub directory_id: DirectoryId,
    pub tree_size: u64,
    #[serde(with = "hash256_hex")]
    pub root_hash: Hash256,
    pub timestamp_millis: u64,
}

/// Log root together with the log service's signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedLogRoot {
    pub root: LogRoot,
    #[serde(with = "signature64_hex")]
    pub signature: Signature64,
}

impl SignedLogRoot {
    pub fn tree_size(&self) -> u64 {
        self.root.tree_size
    }
}

/// RFC 6962 audit path for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub leaf_index: u64,
    pub tree_size: u64,
    #[serde(with = "hash256_vec_hex")]
    pub hashes: Vec<Hash256>,
}

/// RFC 6962 consistency proof between two tree sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConsistencyProof {
    pub first_size: u64,
    pub second_size: u64,
    #[serde(with = "hash256_vec_hex")]
    pub hashes: Vec<Hash256>,
}

/// Latest log root along with proof that it extends an earlier one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRootResponse {
    pub root: SignedLogRoot,
    pub consistency: ConsistencyProof,
}

/// A leaf bracketing an absent index. Carries value digests rather than the
/// leaf hash so the verifier can bind the neighbour's index to its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborProof {
    pub index: MapIndex,
    #[serde(with = "hash256_hex")]
    pub value_hash: Hash256,
    #[serde(with = "hash256_hex")]
    pub extra_hash: Hash256,
    pub position: u64,
    #[serde(with = "hash256_vec_hex")]
    pub path: Vec<Hash256>,
}

/// Proof of presence or absence of one index in a map revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MapLeafProof {
    Present {
        leaf: MapLeaf,
        position: u64,
        #[serde(with = "hash256_vec_hex")]
        path: Vec<Hash256>,
    },
    Absent {
        index: MapIndex,
        left: Option<NeighborProof>,
        right: Option<NeighborProof>,
    },
}

impl MapLeafProof {
    pub fn index(&self) -> MapIndex {
        match self {
            MapLeafProof::Present { leaf, .. } => leaf.index,
            MapLeafProof::Absent { index, .. } => *index,
        }
    }
}

/// Leaves read at a revision, with proofs against that revision's root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapLeavesResponse {
    pub root: SignedMapRoot,
    pub proofs: Vec<MapLeafProof>,
}
