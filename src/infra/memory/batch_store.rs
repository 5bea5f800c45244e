use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{DirectoryId, MapMetadata};
use crate::infra::{BatchStore, Result, SequencerError};

/// Batch definitions held in memory
#[derive(Default)]
pub struct InMemoryBatchStore {
    definitions: RwLock<HashMap<(DirectoryId, u64), MapMetadata>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored definitions across all directories
    pub async fn len(&self) -> usize {
        self.definitions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.definitions.read().await.is_empty()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn write_batch_sources(
        &self,
        directory_id: &DirectoryId,
        revision: u64,
        meta: &MapMetadata,
    ) -> Result<()> {
        if meta.revision != revision {
            return Err(SequencerError::InvalidArgument(format!(
                "metadata is for revision {}, not {revision}",
                meta.revision
            )));
        }
        meta.validate().map_err(SequencerError::InvalidArgument)?;

        let mut definitions = self.definitions.write().await;
        match definitions.get(&(directory_id.clone(), revision)) {
            Some(existing) if existing == meta => Ok(()),
            Some(_) => Err(SequencerError::BatchConflict {
                directory_id: directory_id.clone(),
                revision,
            }),
            None => {
                definitions.insert((directory_id.clone(), revision), meta.clone());
                Ok(())
            }
        }
    }

    async fn read_batch(&self, directory_id: &DirectoryId, revision: u64) -> Result<MapMetadata> {
        self.definitions
            .read()
            .await
            .get(&(directory_id.clone(), revision))
            .cloned()
            .ok_or_else(|| SequencerError::BatchNotFound {
                directory_id: directory_id.clone(),
                revision,
            })
    }
}
