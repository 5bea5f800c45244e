//! Trait definitions for the sequencer's collaborators

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    DirectoryId, IndexedUpdate, LogId, LogMessage, LogRootResponse, InclusionProof, MapIndex,
    MapLeaf, MapLeavesResponse, MapMetadata, SignedMapRoot, Watermark,
};

use super::{MutationError, Result};

/// Read access to the per-directory mutation logs.
///
/// Observing a log never consumes it; consumption is recorded only by batch
/// definitions.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogReader: Send + Sync {
    /// Writable log sources for a directory, in ascending id order
    async fn list_sources(&self, directory_id: &DirectoryId) -> Result<Vec<LogId>>;

    /// Count up to `max_items` messages after `after` and return the
    /// watermark of the last one counted (or `after` if none)
    async fn high_watermark(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        after: Watermark,
        max_items: u64,
    ) -> Result<(u64, Watermark)>;

    /// Read at most `page_size` messages with `low < id <= high`, ascending
    async fn read_range(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        low: Watermark,
        high: Watermark,
        page_size: u64,
    ) -> Result<Vec<LogMessage>>;
}

/// Append side of the mutation logs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MutationQueue: Send + Sync {
    /// Append a mutation and return its assigned watermark
    async fn send(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        payload: Vec<u8>,
    ) -> Result<Watermark>;
}

/// Durable record of which log windows built which revision.
///
/// Writes are idempotent: an identical definition for an existing
/// `(directory, revision)` succeeds, a different one fails with
/// `SequencerError::BatchConflict`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn write_batch_sources(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        meta: &MapMetadata,
    ) -> Result<()>;

    /// Fails with `SequencerError::BatchNotFound` if undefined
    async fn read_batch(&self, directory_id: &DirectoryId, revision: u64) -> Result<MapMetadata>;
}

/// Versioned map backend. Responses are untrusted until verified by
/// `VerifyingMapClient`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MapService: Send + Sync {
    async fn get_latest_root(&self, directory_id: &DirectoryId) -> Result<SignedMapRoot>;

    async fn get_root_at_revision(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
    ) -> Result<SignedMapRoot>;

    /// Leaves at `revision` with presence/absence proofs
    async fn get_leaves(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        indices: &[MapIndex],
    ) -> Result<MapLeavesResponse>;

    /// Atomically write `leaves` as `revision`, which must be latest + 1
    async fn set_leaves(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        leaves: Vec<MapLeaf>,
        metadata: MapMetadata,
    ) -> Result<SignedMapRoot>;
}

/// Append-only log backend used to publish map roots. Responses are untrusted
/// until verified by `VerifyingLogClient`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LogService: Send + Sync {
    /// Latest root and a consistency proof from `first_tree_size`
    async fn get_latest_root(
        &self,
        directory_id: &DirectoryId,
        first_tree_size: u64,
    ) -> Result<LogRootResponse>;

    /// Queue `data` at a fixed index. Re-adding identical data is a no-op;
    /// different data fails with `SequencerError::LeafConflict`.
    async fn add_sequenced_leaf(
        &self,
        directory_id: &DirectoryId,
        data: Vec<u8>,
        index: u64,
    ) -> Result<()>;

    /// Integrated leaf data at `index`, if any
    async fn get_leaf(&self, directory_id: &DirectoryId, index: u64) -> Result<Option<Vec<u8>>>;

    async fn get_inclusion_proof(
        &self,
        directory_id: &DirectoryId,
        index: u64,
        tree_size: u64,
    ) -> Result<InclusionProof>;
}

/// Pluggable mutation semantics.
///
/// `reduce` must be deterministic, idempotent, commutative and associative:
/// the result may not depend on candidate order or on how candidates were
/// split across calls. Implementations take `&self` and must not keep state
/// between calls.
#[cfg_attr(test, automock)]
pub trait MutationResolver: Send + Sync {
    /// Extract the target index from a log message
    fn project(&self, message: &LogMessage) -> std::result::Result<IndexedUpdate, MutationError>;

    /// Combine the existing leaf with candidate updates into the new leaf value
    fn reduce<'a>(
        &self,
        index: &MapIndex,
        existing: Option<&'a MapLeaf>,
        candidates: &[IndexedUpdate],
    ) -> std::result::Result<Vec<u8>, MutationError>;
}
