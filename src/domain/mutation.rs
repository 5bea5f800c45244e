//! Mutation types flowing through the revision builder

use serde::{Deserialize, Serialize};

use super::types::{bytes_hex, signature64_hex};
use super::{LogId, MapIndex, PublicKey32, Signature64, Watermark};
use crate::crypto::{entry_signing_hash, EntrySigningParams};

/// One pending mutation as stored in a log source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub log_id: LogId,
    /// Position of this message in its log
    pub id: Watermark,
    #[serde(with = "bytes_hex")]
    pub payload: Vec<u8>,
}

impl LogMessage {
    pub fn new(log_id: LogId, id: Watermark, payload: Vec<u8>) -> Self {
        Self {
            log_id,
            id,
            payload,
        }
    }
}

/// A log message projected onto the map index it targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedUpdate {
    pub index: MapIndex,
    pub log_id: LogId,
    pub watermark: Watermark,
    /// Raw mutation payload, interpreted by the resolver
    pub update: Vec<u8>,
}

/// Candidate updates for one index joined with what the map holds now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub index: MapIndex,
    /// 0 or 1 leaves; more is a consistency violation
    pub leaves: Vec<MapLeaf>,
    pub updates: Vec<IndexedUpdate>,
}

impl Joined {
    /// The single existing leaf, if any
    pub fn existing(&self) -> Option<&MapLeaf> {
        self.leaves.first()
    }
}

/// The committed value for one index at a revision
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapLeaf {
    pub index: MapIndex,
    #[serde(with = "bytes_hex")]
    pub leaf_value: Vec<u8>,
    #[serde(with = "bytes_hex", default)]
    pub extra_data: Vec<u8>,
}

impl MapLeaf {
    pub fn new(index: MapIndex, leaf_value: Vec<u8>) -> Self {
        Self {
            index,
            leaf_value,
            extra_data: Vec::new(),
        }
    }
}

/// A self-signed directory entry update, the payload format of mutations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    pub index: MapIndex,
    pub user_id: String,
    /// Monotonic per identity; higher versions supersede lower ones
    pub version: u64,
    /// Opaque public key material published for the identity
    pub public_keys: Vec<String>,
    /// Ed25519 key that signed this update
    #[serde(with = "crate::domain::types::hash256_hex")]
    pub authorized_key: PublicKey32,
    #[serde(with = "signature64_hex")]
    pub signature: Signature64,
}

impl SignedEntry {
    /// Hash covered by `signature`
    pub fn signing_hash(&self) -> [u8; 32] {
        entry_signing_hash(&EntrySigningParams {
            index: self.index.as_bytes(),
            user_id: &self.user_id,
            version: self.version,
            public_keys: &self.public_keys,
            authorized_key: &self.authorized_key,
        })
    }

    /// Decode an entry from a mutation payload or leaf value
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Canonical encoding used for payloads and leaf values
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}
