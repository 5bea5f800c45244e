//! Batch definitions: which log windows were consumed to build a revision

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{LogId, Watermark};

/// The exact window of one mutation log consumed for one revision.
///
/// `lowest_watermark` is exclusive, `highest_watermark` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSlice {
    pub log_id: LogId,
    pub lowest_watermark: Watermark,
    pub highest_watermark: Watermark,
}

impl SourceSlice {
    pub fn new(log_id: LogId, lowest_watermark: Watermark, highest_watermark: Watermark) -> Self {
        Self {
            log_id,
            lowest_watermark,
            highest_watermark,
        }
    }

    /// True when the slice covers no positions
    pub fn is_empty(&self) -> bool {
        self.highest_watermark <= self.lowest_watermark
    }

    /// Whether `watermark` lies inside `(low, high]`
    pub fn contains(&self, watermark: Watermark) -> bool {
        watermark > self.lowest_watermark && watermark <= self.highest_watermark
    }
}

/// Batch definition for one `(directory, revision)` pair.
///
/// Immutable once written. It is also attached to the map revision it built,
/// so the latest map root always carries the watermarks to resume from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MapMetadata {
    pub revision: u64,
    pub sources: BTreeMap<LogId, SourceSlice>,
}

impl MapMetadata {
    /// Metadata for a revision that consumed nothing (e.g. revision 0)
    pub fn empty(revision: u64) -> Self {
        Self {
            revision,
            sources: BTreeMap::new(),
        }
    }

    /// Highest consumed watermark per log
    pub fn highest_watermarks(&self) -> BTreeMap<LogId, Watermark> {
        self.sources
            .iter()
            .map(|(id, slice)| (*id, slice.highest_watermark))
            .collect()
    }

    /// Highest consumed watermark for one log, or the origin if never read
    pub fn highest_watermark(&self, log_id: LogId) -> Watermark {
        self.sources
            .get(&log_id)
            .map(|s| s.highest_watermark)
            .unwrap_or(0)
    }

    /// Build the definition for the following revision.
    ///
    /// Every log known to `self` is carried forward, with an empty slice if it
    /// has no entry in `new_highs`.
    pub fn next(&self, revision: u64, new_highs: &BTreeMap<LogId, Watermark>) -> MapMetadata {
        let mut sources = BTreeMap::new();
        for log_id in self.sources.keys().chain(new_highs.keys()) {
            if sources.contains_key(log_id) {
                continue;
            }
            let low = self.highest_watermark(*log_id);
            let high = new_highs.get(log_id).copied().unwrap_or(low).max(low);
            sources.insert(*log_id, SourceSlice::new(*log_id, low, high));
        }
        MapMetadata { revision, sources }
    }

    /// True when no slice covers any position
    pub fn is_empty(&self) -> bool {
        self.sources.values().all(SourceSlice::is_empty)
    }

    /// Structural validation of a single definition
    pub fn validate(&self) -> Result<(), String> {
        for (key, slice) in &self.sources {
            if *key != slice.log_id {
                return Err(format!(
                    "source keyed by log {} describes log {}",
                    key, slice.log_id
                ));
            }
            if slice.highest_watermark < slice.lowest_watermark {
                return Err(format!(
                    "log {} slice is inverted: ({}, {}]",
                    key, slice.lowest_watermark, slice.highest_watermark
                ));
            }
        }
        Ok(())
    }

    /// Check that this definition continues exactly where `prev` stopped.
    ///
    /// Every log in `prev` must appear here with `lowest == prev.highest`, and
    /// new logs must start at the origin.
    pub fn check_follows(&self, prev: &MapMetadata) -> Result<(), String> {
        self.validate()?;
        for (log_id, prev_slice) in &prev.sources {
            match self.sources.get(log_id) {
                None => {
                    return Err(format!(
                        "log {} present at revision {} is missing from revision {}",
                        log_id, prev.revision, self.revision
                    ))
                }
                Some(slice) if slice.lowest_watermark != prev_slice.highest_watermark => {
                    return Err(format!(
                        "log {} is not contiguous: revision {} ended at {}, revision {} starts at {}",
                        log_id,
                        prev.revision,
                        prev_slice.highest_watermark,
                        self.revision,
                        slice.lowest_watermark
                    ))
                }
                Some(_) => {}
            }
        }
        for (log_id, slice) in &self.sources {
            if !prev.sources.contains_key(log_id) && slice.lowest_watermark != 0 {
                return Err(format!(
                    "new log {} must start at the origin, starts at {}",
                    log_id, slice.lowest_watermark
                ));
            }
        }
        Ok(())
    }

    /// Stable byte encoding (sources are ordered by log id)
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        // BTreeMap ordering makes this deterministic; serialization of plain
        // integers and maps cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Cursor for paginating across the slices of a revision in ascending log order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReadToken {
    /// Position of the slice in ascending log-id order
    pub shard_id: u32,
    /// Exclusive lower bound inside that slice
    pub low_watermark: Watermark,
}

impl ReadToken {
    pub fn new(shard_id: u32, low_watermark: Watermark) -> Self {
        Self {
            shard_id,
            low_watermark,
        }
    }

    /// Encode as an opaque, URL-safe page token
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a page token; an empty string means "from the beginning"
    pub fn decode(token: &str) -> Result<Option<Self>, String> {
        if token.is_empty() {
            return Ok(None);
        }
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| format!("invalid page token: {e}"))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| format!("invalid page token: {e}"))
    }
}
