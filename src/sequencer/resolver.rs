use tracing::warn;

use crate::crypto::{sha256, verify_entry, Hash256};
use crate::domain::{IndexedUpdate, LogMessage, MapIndex, MapLeaf, SignedEntry};
use crate::infra::{MutationError, MutationResolver};

/// Default mutation semantics for directory entries.
///
/// Payloads are self-signed `SignedEntry` updates. The new leaf value is the
/// greatest of the existing entry and all valid candidates, ordered by
/// `(version, SHA-256 of the canonical encoding)`. A maximum over a total
/// order does not depend on candidate order or grouping.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionedEntryResolver;

impl VersionedEntryResolver {
    pub fn new() -> Self {
        Self
    }

    fn candidate(
        &self,
        index: &MapIndex,
        update: &IndexedUpdate,
    ) -> Result<SignedEntry, MutationError> {
        let entry =
            SignedEntry::from_bytes(&update.update).map_err(|e| MutationError::Malformed {
                log_id: update.log_id,
                watermark: update.watermark,
                reason: e.to_string(),
            })?;
        if entry.index != *index {
            return Err(MutationError::WrongIndex {
                expected: *index,
                actual: entry.index,
            });
        }
        verify_entry(&entry).map_err(|_| MutationError::InvalidSignature(*index))?;
        Ok(entry)
    }
}

/// Total order key of an entry
fn rank(entry: &SignedEntry) -> (u64, Hash256, Vec<u8>) {
    let bytes = entry.to_bytes();
    (entry.version, sha256(&bytes), bytes)
}

impl MutationResolver for VersionedEntryResolver {
    fn project(&self, message: &LogMessage) -> Result<IndexedUpdate, MutationError> {
        let entry =
            SignedEntry::from_bytes(&message.payload).map_err(|e| MutationError::Malformed {
                log_id: message.log_id,
                watermark: message.id,
                reason: e.to_string(),
            })?;
        Ok(IndexedUpdate {
            index: entry.index,
            log_id: message.log_id,
            watermark: message.id,
            update: message.payload.clone(),
        })
    }

    fn reduce(
        &self,
        index: &MapIndex,
        existing: Option<&MapLeaf>,
        candidates: &[IndexedUpdate],
    ) -> Result<Vec<u8>, MutationError> {
        let current = existing
            .map(|leaf| {
                SignedEntry::from_bytes(&leaf.leaf_value).map_err(|e| MutationError::CorruptLeaf {
                    index: *index,
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let mut best = current.as_ref().map(rank);
        let mut valid = 0usize;
        for update in candidates {
            match self.candidate(index, update) {
                Ok(entry) => {
                    valid += 1;
                    let ranked = rank(&entry);
                    if best.as_ref().map_or(true, |b| ranked > *b) {
                        best = Some(ranked);
                    }
                }
                Err(e) => warn!(
                    log_id = %update.log_id,
                    watermark = update.watermark,
                    error = %e,
                    "Rejected mutation"
                ),
            }
        }

        match best {
            Some((_, _, bytes)) if valid > 0 => Ok(bytes),
            _ => Err(MutationError::NoValidCandidate(*index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeyPair;
    use crate::domain::LogId;

    fn index(b: u8) -> MapIndex {
        MapIndex::from_bytes([b; 32])
    }

    fn update(entry: &SignedEntry, watermark: u64) -> IndexedUpdate {
        IndexedUpdate {
            index: entry.index,
            log_id: LogId(1),
            watermark,
            update: entry.to_bytes(),
        }
    }

    fn entry(key: &SigningKeyPair, version: u64, pk: &str) -> SignedEntry {
        key.sign_entry(index(1), "alice", version, vec![pk.to_string()])
    }

    #[test]
    fn test_project_extracts_index() {
        let key = SigningKeyPair::generate();
        let e = entry(&key, 1, "keyA");
        let message = LogMessage::new(LogId(3), 7, e.to_bytes());
        let projected = VersionedEntryResolver.project(&message).unwrap();
        assert_eq!(projected.index, index(1));
        assert_eq!(projected.watermark, 7);

        let bad = LogMessage::new(LogId(3), 8, b"not json".to_vec());
        assert!(matches!(
            VersionedEntryResolver.project(&bad),
            Err(MutationError::Malformed { watermark: 8, .. })
        ));
    }

    #[test]
    fn test_higher_version_wins() {
        let key = SigningKeyPair::generate();
        let old = entry(&key, 1, "keyA");
        let new = entry(&key, 2, "keyB");
        let existing = MapLeaf::new(index(1), old.to_bytes());

        let value = VersionedEntryResolver
            .reduce(&index(1), Some(&existing), &[update(&new, 1)])
            .unwrap();
        assert_eq!(value, new.to_bytes());

        let value = VersionedEntryResolver
            .reduce(&index(1), Some(&MapLeaf::new(index(1), new.to_bytes())), &[update(&old, 2)])
            .unwrap();
        assert_eq!(value, new.to_bytes());
    }

    #[test]
    fn test_order_and_split_do_not_matter() {
        let key = SigningKeyPair::generate();
        let a = entry(&key, 3, "keyA");
        let b = entry(&key, 3, "keyB");
        let c = entry(&key, 2, "keyC");
        let r = VersionedEntryResolver;

        let ab = r.reduce(&index(1), None, &[update(&a, 1), update(&b, 2)]).unwrap();
        let ba = r.reduce(&index(1), None, &[update(&b, 2), update(&a, 1)]).unwrap();
        assert_eq!(ab, ba);

        let all = r
            .reduce(&index(1), None, &[update(&a, 1), update(&b, 2), update(&c, 3)])
            .unwrap();
        let split = r
            .reduce(&index(1), Some(&MapLeaf::new(index(1), ab.clone())), &[update(&c, 3)])
            .unwrap();
        assert_eq!(all, split);
    }

    #[test]
    fn test_invalid_candidates_are_excluded() {
        let key = SigningKeyPair::generate();
        let good = entry(&key, 1, "keyA");
        let mut forged = entry(&key, 9, "keyEvil");
        forged.public_keys = vec!["swapped".to_string()];
        let elsewhere = key.sign_entry(index(2), "bob", 5, vec!["keyC".to_string()]);

        let value = VersionedEntryResolver
            .reduce(
                &index(1),
                None,
                &[update(&forged, 1), update(&elsewhere, 2), update(&good, 3)],
            )
            .unwrap();
        assert_eq!(value, good.to_bytes());
    }

    #[test]
    fn test_no_valid_candidate() {
        let key = SigningKeyPair::generate();
        let existing = MapLeaf::new(index(1), entry(&key, 1, "keyA").to_bytes());
        let garbage = IndexedUpdate {
            index: index(1),
            log_id: LogId(1),
            watermark: 4,
            update: b"{}".to_vec(),
        };
        let err = VersionedEntryResolver
            .reduce(&index(1), Some(&existing), &[garbage])
            .unwrap_err();
        assert_eq!(err, MutationError::NoValidCandidate(index(1)));
    }

    #[test]
    fn test_corrupt_existing_leaf() {
        let key = SigningKeyPair::generate();
        let existing = MapLeaf::new(index(1), b"corrupt".to_vec());
        let err = VersionedEntryResolver
            .reduce(&index(1), Some(&existing), &[update(&entry(&key, 1, "k"), 1)])
            .unwrap_err();
        assert!(matches!(err, MutationError::CorruptLeaf { .. }));
    }
}
