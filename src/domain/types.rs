//! Core identifier types for the key transparency sequencer

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte hash (SHA-256)
pub type Hash256 = [u8; 32];

/// 64-byte Ed25519 signature
pub type Signature64 = [u8; 64];

/// 32-byte Ed25519 public key
pub type PublicKey32 = [u8; 32];

/// Position inside one mutation log. Strictly increasing per log; `0` is the origin.
pub type Watermark = u64;

/// Maximum length of a directory identifier
pub const MAX_DIRECTORY_ID_LEN: usize = 64;

/// Directory (tenant) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryId(pub String);

impl DirectoryId {
    /// Create a directory ID without validation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse and validate a directory ID
    ///
    /// Allowed characters: ASCII alphanumerics, `_`, `-` and `.`.
    pub fn parse(id: &str) -> Result<Self, String> {
        if id.is_empty() || id.len() > MAX_DIRECTORY_ID_LEN {
            return Err(format!(
                "directory id must be 1-{} characters",
                MAX_DIRECTORY_ID_LEN
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(format!("directory id contains invalid characters: {id}"));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DirectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DirectoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Mutation log identifier within a directory
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct LogId(pub i64);

impl LogId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-width identity key in the map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapIndex(#[serde(with = "hash256_hex")] pub Hash256);

impl MapIndex {
    pub fn from_bytes(bytes: Hash256) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &Hash256 {
        &self.0
    }

    /// Parse from a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|e| e.to_string())?;
        let arr: Hash256 = bytes
            .try_into()
            .map_err(|_| "expected 32 bytes for map index".to_string())?;
        Ok(Self(arr))
    }
}

impl fmt::Display for MapIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Serde module for serializing Hash256 as hex strings
pub mod hash256_hex {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes for Hash256"))
    }
}

/// Serde module for Signature64 as hex strings
pub mod signature64_hex {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes for Signature64"))
    }
}

/// Serde module for arbitrary byte vectors as hex strings
pub mod bytes_hex {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde module for a list of Hash256 values as hex strings
pub mod hash256_vec_hex {
    use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(hashes: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: Vec<String> = hashes.iter().map(hex::encode).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Vec<String> = Vec::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|s| {
                let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
                bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes for Hash256"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_id_validation() {
        assert!(DirectoryId::parse("default").is_ok());
        assert!(DirectoryId::parse("tenant-1.prod_eu").is_ok());
        assert!(DirectoryId::parse("").is_err());
        assert!(DirectoryId::parse("has space").is_err());
        assert!(DirectoryId::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_map_index_hex() {
        let index = MapIndex::from_bytes([0xab; 32]);
        let parsed = MapIndex::from_hex(&index.to_string()).unwrap();
        assert_eq!(parsed, index);
        assert!(MapIndex::from_hex("abcd").is_err());
    }

    #[test]
    fn test_map_index_serde_is_hex_string() {
        let index = MapIndex::from_bytes([1; 32]);
        let json = serde_json::to_string(&index).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
    }
}
