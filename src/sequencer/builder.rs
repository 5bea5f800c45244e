//! Revision builder
//!
//! Reads the log windows named by a batch definition, groups the mutations by
//! map index, joins each group with the leaf the map holds at the previous
//! revision and reduces it to the new leaf value. All new leaves are written
//! in one `set_leaves` call.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use crate::clients::VerifyingMapClient;
use crate::domain::{
    DirectoryId, IndexedUpdate, Joined, LogMessage, MapIndex, MapLeaf, MapMetadata,
    SignedMapRoot, SourceSlice,
};
use crate::infra::{LogReader, MutationResolver, Result, SequencerError};

/// Indices per `get_leaves` request
const LEAF_FETCH_CHUNK: usize = 256;

/// Counters from one build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Messages read across all slices
    pub messages: usize,
    /// Messages that could not be projected onto an index
    pub unprojectable: usize,
    /// Indices dropped because no candidate survived reduction
    pub dropped_indices: usize,
    /// Indices whose reduced value equals the existing leaf
    pub unchanged: usize,
}

/// Leaves to commit for one revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionPlan {
    pub directory_id: DirectoryId,
    pub metadata: MapMetadata,
    /// New leaf values, ordered by index
    pub leaves: Vec<MapLeaf>,
    pub stats: BuildStats,
}

impl RevisionPlan {
    pub fn revision(&self) -> u64 {
        self.metadata.revision
    }
}

/// Builds one map revision from a batch definition
pub struct RevisionBuilder {
    reader: Arc<dyn LogReader>,
    map: Arc<VerifyingMapClient>,
    resolver: Arc<dyn MutationResolver>,
    page_size: u64,
}

impl RevisionBuilder {
    pub fn new(
        reader: Arc<dyn LogReader>,
        map: Arc<VerifyingMapClient>,
        resolver: Arc<dyn MutationResolver>,
        page_size: u64,
    ) -> Self {
        Self {
            reader,
            map,
            resolver,
            page_size: page_size.max(1),
        }
    }

    /// Read every message in one slice, a page at a time
    pub async fn read_slice(
        &self,
        directory_id: &DirectoryId,
        slice: &SourceSlice,
    ) -> Result<Vec<LogMessage>> {
        let mut messages = Vec::new();
        let mut cursor = slice.lowest_watermark;

        while cursor < slice.highest_watermark {
            let page = self
                .reader
                .read_range(
                    directory_id,
                    slice.log_id,
                    cursor,
                    slice.highest_watermark,
                    self.page_size,
                )
                .await?;
            let full = page.len() as u64 >= self.page_size;

            for message in page {
                if message.log_id != slice.log_id
                    || message.id <= cursor
                    || !slice.contains(message.id)
                {
                    return Err(SequencerError::IntegrityViolation(format!(
                        "log {} returned message {}/{} outside ({cursor}, {}]",
                        slice.log_id, message.log_id, message.id, slice.highest_watermark
                    )));
                }
                cursor = message.id;
                messages.push(message);
            }

            if !full {
                break;
            }
        }

        Ok(messages)
    }

    /// Read all slices of a definition concurrently, in ascending log order
    pub async fn read_messages(
        &self,
        directory_id: &DirectoryId,
        metadata: &MapMetadata,
    ) -> Result<Vec<LogMessage>> {
        let reads = metadata
            .sources
            .values()
            .filter(|slice| !slice.is_empty())
            .map(|slice| self.read_slice(directory_id, slice));
        Ok(try_join_all(reads).await?.into_iter().flatten().collect())
    }

    fn group(&self, messages: &[LogMessage]) -> (BTreeMap<MapIndex, Vec<IndexedUpdate>>, usize) {
        let mut groups: BTreeMap<MapIndex, Vec<IndexedUpdate>> = BTreeMap::new();
        let mut unprojectable = 0;
        for message in messages {
            match self.resolver.project(message) {
                Ok(update) => groups.entry(update.index).or_default().push(update),
                Err(e) => {
                    unprojectable += 1;
                    warn!(
                        log_id = %message.log_id,
                        watermark = message.id,
                        error = %e,
                        "Skipping mutation"
                    );
                }
            }
        }
        (groups, unprojectable)
    }

    /// Fetch and verify the existing leaves at `revision` for every group
    async fn join(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        groups: BTreeMap<MapIndex, Vec<IndexedUpdate>>,
    ) -> Result<Vec<Joined>> {
        let indices: Vec<MapIndex> = groups.keys().copied().collect();
        let fetches = indices
            .chunks(LEAF_FETCH_CHUNK)
            .map(|chunk| self.map.get_and_verify_leaves(directory_id, revision, chunk));
        let mut existing: BTreeMap<MapIndex, Vec<MapLeaf>> = BTreeMap::new();
        for part in try_join_all(fetches).await? {
            existing.extend(part);
        }

        groups
            .into_iter()
            .map(|(index, updates)| {
                let leaves = existing.remove(&index).unwrap_or_default();
                if leaves.len() > 1 {
                    return Err(SequencerError::IntegrityViolation(format!(
                        "{} leaves for index {index} at revision {revision}",
                        leaves.len()
                    )));
                }
                Ok(Joined {
                    index,
                    leaves,
                    updates,
                })
            })
            .collect()
    }

    fn reduce(&self, joined: Vec<Joined>, stats: &mut BuildStats) -> Vec<MapLeaf> {
        let mut leaves = Vec::with_capacity(joined.len());
        for group in joined {
            match self
                .resolver
                .reduce(&group.index, group.existing(), &group.updates)
            {
                Ok(value) => {
                    if group.existing().map(|l| &l.leaf_value) == Some(&value) {
                        stats.unchanged += 1;
                    } else {
                        leaves.push(MapLeaf::new(group.index, value));
                    }
                }
                Err(e) => {
                    stats.dropped_indices += 1;
                    warn!(index = %group.index, error = %e, "Dropping index from revision");
                }
            }
        }
        leaves
    }

    /// Compute the leaves for the revision described by `metadata`.
    ///
    /// Reads only; the map's previous revision must exist. Running this twice
    /// on the same definition yields the same plan.
    #[instrument(skip(self, metadata), fields(directory_id = %directory_id, revision = metadata.revision))]
    pub async fn build(
        &self,
        directory_id: &DirectoryId,
        metadata: &MapMetadata,
    ) -> Result<RevisionPlan> {
        let base = metadata.revision.checked_sub(1).ok_or_else(|| {
            SequencerError::InvalidArgument("revision 0 is the empty map".to_string())
        })?;
        metadata.validate().map_err(SequencerError::InvalidArgument)?;

        let messages = self.read_messages(directory_id, metadata).await?;
        let mut stats = BuildStats {
            messages: messages.len(),
            ..BuildStats::default()
        };

        let (groups, unprojectable) = self.group(&messages);
        stats.unprojectable = unprojectable;
        debug!(
            messages = stats.messages,
            indices = groups.len(),
            "Grouped mutations"
        );

        let joined = self.join(directory_id, base, groups).await?;
        let leaves = self.reduce(joined, &mut stats);

        Ok(RevisionPlan {
            directory_id: directory_id.clone(),
            metadata: metadata.clone(),
            leaves,
            stats,
        })
    }

    /// Write a plan as one atomic map revision
    #[instrument(skip(self, plan), fields(directory_id = %plan.directory_id, revision = plan.revision(), leaves = plan.leaves.len()))]
    pub async fn commit(&self, plan: RevisionPlan) -> Result<SignedMapRoot> {
        let revision = plan.revision();
        let root = self
            .map
            .set_leaves(&plan.directory_id, revision, plan.leaves, plan.metadata)
            .await?;
        info!(
            leaf_count = root.root.leaf_count,
            root_hash = %hex::encode(root.root.root_hash),
            "Map revision written"
        );
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeyPair;
    use crate::domain::{LogId, MapLeafProof, MapLeavesResponse};
    use crate::infra::{
        InMemoryMapService, InMemoryMutationLog, MockLogReader, MockMapService, MutationQueue,
    };
    use crate::infra::MapService;
    use crate::sequencer::VersionedEntryResolver;

    fn dir() -> DirectoryId {
        DirectoryId::new("d")
    }

    fn index(b: u8) -> MapIndex {
        MapIndex::from_bytes([b; 32])
    }

    async fn setup() -> (Arc<InMemoryMutationLog>, Arc<InMemoryMapService>, RevisionBuilder) {
        let log = Arc::new(InMemoryMutationLog::new());
        log.create_log(&dir(), LogId(1)).await;
        let map = Arc::new(InMemoryMapService::new(SigningKeyPair::generate()));
        map.create_directory(&dir()).await;
        let client = Arc::new(VerifyingMapClient::new(map.clone(), map.verifier()));
        let builder = RevisionBuilder::new(
            log.clone(),
            client,
            Arc::new(VersionedEntryResolver::new()),
            2,
        );
        (log, map, builder)
    }

    fn meta(revision: u64, low: u64, high: u64) -> MapMetadata {
        MapMetadata {
            revision,
            sources: BTreeMap::from([(LogId(1), SourceSlice::new(LogId(1), low, high))]),
        }
    }

    #[tokio::test]
    async fn test_paged_read_covers_window() {
        let (log, _, builder) = setup().await;
        for i in 0..5u8 {
            log.send(&dir(), LogId(1), vec![i]).await.unwrap();
        }
        let slice = SourceSlice::new(LogId(1), 1, 5);
        let messages = builder.read_slice(&dir(), &slice).await.unwrap();
        assert_eq!(
            messages.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![2, 3, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_out_of_window_message_is_rejected() {
        let mut reader = MockLogReader::new();
        reader
            .expect_read_range()
            .returning(|_, log_id, _, _, _| Ok(vec![LogMessage::new(log_id, 9, vec![])]));
        let map = Arc::new(InMemoryMapService::new(SigningKeyPair::generate()));
        let builder = RevisionBuilder::new(
            Arc::new(reader),
            Arc::new(VerifyingMapClient::new(map.clone(), map.verifier())),
            Arc::new(VersionedEntryResolver::new()),
            10,
        );
        let err = builder
            .read_slice(&dir(), &SourceSlice::new(LogId(1), 0, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::IntegrityViolation(_)));
    }

    #[tokio::test]
    async fn test_build_is_deterministic_and_skips_bad_items() {
        let (log, _, builder) = setup().await;
        let key = SigningKeyPair::generate();
        let alice = key.sign_entry(index(1), "alice", 1, vec!["keyA".into()]);
        let bob = key.sign_entry(index(2), "bob", 1, vec!["keyC".into()]);
        log.send(&dir(), LogId(1), alice.to_bytes()).await.unwrap();
        log.send(&dir(), LogId(1), b"garbage".to_vec()).await.unwrap();
        log.send(&dir(), LogId(1), bob.to_bytes()).await.unwrap();

        let first = builder.build(&dir(), &meta(1, 0, 3)).await.unwrap();
        let second = builder.build(&dir(), &meta(1, 0, 3)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.leaves.len(), 2);
        assert_eq!(first.stats.unprojectable, 1);
        assert_eq!(first.leaves[0].index, index(1));
        assert_eq!(first.leaves[1].leaf_value, bob.to_bytes());

        let root = builder.commit(first).await.unwrap();
        assert_eq!(root.revision(), 1);
        assert_eq!(root.root.leaf_count, 2);
    }

    #[tokio::test]
    async fn test_unchanged_values_are_not_rewritten() {
        let (log, _, builder) = setup().await;
        let key = SigningKeyPair::generate();
        let alice = key.sign_entry(index(1), "alice", 2, vec!["keyA".into()]);
        let stale = key.sign_entry(index(1), "alice", 1, vec!["keyOld".into()]);
        log.send(&dir(), LogId(1), alice.to_bytes()).await.unwrap();
        log.send(&dir(), LogId(1), stale.to_bytes()).await.unwrap();

        let plan = builder.build(&dir(), &meta(1, 0, 1)).await.unwrap();
        builder.commit(plan).await.unwrap();

        let plan = builder.build(&dir(), &meta(2, 1, 2)).await.unwrap();
        assert!(plan.leaves.is_empty());
        assert_eq!(plan.stats.unchanged, 1);
    }

    #[tokio::test]
    async fn test_duplicate_existing_leaves_are_fatal() {
        let key = SigningKeyPair::generate();
        let entry = key.sign_entry(index(1), "alice", 1, vec!["keyA".into()]);

        let log = Arc::new(InMemoryMutationLog::new());
        log.create_log(&dir(), LogId(1)).await;
        log.send(&dir(), LogId(1), entry.to_bytes()).await.unwrap();

        let real = InMemoryMapService::new(SigningKeyPair::generate());
        real.create_directory(&dir()).await;
        real.set_leaves(&dir(), 1, vec![MapLeaf::new(index(1), entry.to_bytes())], MapMetadata::empty(1))
            .await
            .unwrap();
        let response = real.get_leaves(&dir(), 1, &[index(1)]).await.unwrap();
        let doubled = MapLeavesResponse {
            root: response.root.clone(),
            proofs: vec![response.proofs[0].clone(), response.proofs[0].clone()],
        };
        assert!(matches!(doubled.proofs[0], MapLeafProof::Present { .. }));

        let mut mock = MockMapService::new();
        mock.expect_get_leaves()
            .returning(move |_, _, _| Ok(doubled.clone()));
        let builder = RevisionBuilder::new(
            log,
            Arc::new(VerifyingMapClient::new(Arc::new(mock), real.verifier())),
            Arc::new(VersionedEntryResolver::new()),
            10,
        );

        let err = builder.build(&dir(), &meta(2, 0, 1)).await.unwrap_err();
        assert!(matches!(err, SequencerError::IntegrityViolation(_)));
    }
}
