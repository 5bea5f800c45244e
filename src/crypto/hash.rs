//! Hashing with domain separation
//!
//! - RFC 6962 leaf/node prefixes for every Merkle tree (map and log)
//! - Domain prefixes for signed entries, map roots and log roots
//! - Big-endian encoding for integers, length-prefixed strings

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 hash
pub type Hash256 = [u8; 32];

// ============================================================================
// Domain Separation Constants
// ============================================================================

/// RFC 6962 leaf prefix
pub const RFC6962_LEAF_PREFIX: u8 = 0x00;

/// RFC 6962 internal node prefix
pub const RFC6962_NODE_PREFIX: u8 = 0x01;

/// Domain prefix for entry update signatures
pub const DOMAIN_ENTRY: &[u8] = b"KT_ENTRY_V1";

/// Domain prefix for map leaf hashing
pub const DOMAIN_MAP_LEAF: &[u8] = b"KT_MAP_LEAF_V1";

/// Domain prefix for map root signatures
pub const DOMAIN_MAP_ROOT: &[u8] = b"KT_MAP_ROOT_V1";

/// Domain prefix for log root signatures
pub const DOMAIN_LOG_ROOT: &[u8] = b"KT_LOG_ROOT_V1";

// ============================================================================
// Binary Encoding Helpers
// ============================================================================

/// Encode a u32 as 4 bytes big-endian
#[inline]
pub fn u32_be(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Encode a u64 as 8 bytes big-endian
#[inline]
pub fn u64_be(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Encode a string as length-prefixed UTF-8 bytes
/// Format: U32_BE(len) || UTF8_bytes
pub fn encode_string(s: &str) -> Vec<u8> {
    let utf8_bytes = s.as_bytes();
    let mut result = Vec::with_capacity(4 + utf8_bytes.len());
    result.extend_from_slice(&u32_be(utf8_bytes.len() as u32));
    result.extend_from_slice(utf8_bytes);
    result
}

/// Plain SHA-256
pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

// ============================================================================
// RFC 6962 Tree Hashing
// ============================================================================

/// Hash of an empty tree: SHA256("")
pub fn empty_root() -> Hash256 {
    sha256(&[])
}

/// RFC 6962 leaf hash: SHA256(0x00 || data)
pub fn rfc6962_leaf_hash(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([RFC6962_LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

/// RFC 6962 interior node hash: SHA256(0x01 || left || right)
pub fn rfc6962_node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([RFC6962_NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Map leaf hash
///
/// leaf_hash = RFC6962_LEAF(b"KT_MAP_LEAF_V1" || index || SHA256(leaf_value) || SHA256(extra_data))
pub fn map_leaf_hash(index: &Hash256, leaf_value: &[u8], extra_data: &[u8]) -> Hash256 {
    map_leaf_hash_from_digests(index, &sha256(leaf_value), &sha256(extra_data))
}

/// Map leaf hash from precomputed value digests (used for neighbour proofs)
pub fn map_leaf_hash_from_digests(
    index: &Hash256,
    value_hash: &Hash256,
    extra_hash: &Hash256,
) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([RFC6962_LEAF_PREFIX]);
    hasher.update(DOMAIN_MAP_LEAF);
    hasher.update(index);
    hasher.update(value_hash);
    hasher.update(extra_hash);
    hasher.finalize().into()
}

// ============================================================================
// Signing Preimages
// ============================================================================

/// Parameters covered by an entry update signature
#[derive(Debug, Clone)]
pub struct EntrySigningParams<'a> {
    pub index: &'a Hash256,
    pub user_id: &'a str,
    pub version: u64,
    pub public_keys: &'a [String],
    pub authorized_key: &'a [u8; 32],
}

/// Compute the hash an entry update signature covers
///
/// SHA256(b"KT_ENTRY_V1" || index || STR(user_id) || U64_BE(version) ||
///        U32_BE(n) || STR(key_1) .. STR(key_n) || authorized_key)
pub fn entry_signing_hash(params: &EntrySigningParams) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_ENTRY);
    hasher.update(params.index);
    hasher.update(encode_string(params.user_id));
    hasher.update(u64_be(params.version));
    hasher.update(u32_be(params.public_keys.len() as u32));
    for key in params.public_keys {
        hasher.update(encode_string(key));
    }
    hasher.update(params.authorized_key);
    hasher.finalize().into()
}

/// Parameters covered by a map root signature
#[derive(Debug, Clone)]
pub struct MapRootSigningParams<'a> {
    pub directory_id: &'a str,
    pub revision: u64,
    pub leaf_count: u64,
    pub root_hash: &'a Hash256,
    pub timestamp_millis: u64,
    pub metadata: &'a [u8],
}

/// Compute the hash a map root signature covers
///
/// SHA256(b"KT_MAP_ROOT_V1" || STR(dir) || U64_BE(revision) || U64_BE(leaf_count) ||
///        root_hash || U64_BE(timestamp) || SHA256(metadata))
pub fn map_root_signing_hash(params: &MapRootSigningParams) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_MAP_ROOT);
    hasher.update(encode_string(params.directory_id));
    hasher.update(u64_be(params.revision));
    hasher.update(u64_be(params.leaf_count));
    hasher.update(params.root_hash);
    hasher.update(u64_be(params.timestamp_millis));
    hasher.update(sha256(params.metadata));
    hasher.finalize().into()
}

/// Compute the hash a log root signature covers
///
/// SHA256(b"KT_LOG_ROOT_V1" || STR(dir) || U64_BE(tree_size) || root_hash || U64_BE(timestamp))
pub fn log_root_signing_hash(
    directory_id: &str,
    tree_size: u64,
    root_hash: &Hash256,
    timestamp_millis: u64,
) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_LOG_ROOT);
    hasher.update(encode_string(directory_id));
    hasher.update(u64_be(tree_size));
    hasher.update(root_hash);
    hasher.update(u64_be(timestamp_millis));
    hasher.finalize().into()
}
