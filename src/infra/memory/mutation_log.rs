use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{DirectoryId, LogId, LogMessage, Watermark};
use crate::infra::{LogReader, MutationQueue, Result, SequencerError};

#[derive(Default)]
struct LogState {
    writable: bool,
    /// Payload for watermark `i + 1` at position `i`
    payloads: Vec<Vec<u8>>,
}

/// Mutation logs held in memory, watermarks assigned 1, 2, 3, ...
#[derive(Default)]
pub struct InMemoryMutationLog {
    logs: RwLock<HashMap<DirectoryId, BTreeMap<LogId, LogState>>>,
}

impl InMemoryMutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a writable log source; no-op if it exists
    pub async fn create_log(&self, directory_id: &DirectoryId, log_id: LogId) {
        self.logs
            .write()
            .await
            .entry(directory_id.clone())
            .or_default()
            .entry(log_id)
            .or_insert_with(|| LogState {
                writable: true,
                payloads: Vec::new(),
            });
    }

    pub async fn set_writable(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        writable: bool,
    ) -> Result<()> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(directory_id)
            .and_then(|d| d.get_mut(&log_id))
            .ok_or_else(|| unknown_log(directory_id, log_id))?;
        log.writable = writable;
        Ok(())
    }
}

fn unknown_log(directory_id: &DirectoryId, log_id: LogId) -> SequencerError {
    SequencerError::InvalidArgument(format!("unknown log {log_id} in directory {directory_id}"))
}

fn clamp(watermark: Watermark, len: usize) -> usize {
    usize::try_from(watermark).unwrap_or(usize::MAX).min(len)
}

#[async_trait]
impl MutationQueue for InMemoryMutationLog {
    async fn send(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        payload: Vec<u8>,
    ) -> Result<Watermark> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(directory_id)
            .and_then(|d| d.get_mut(&log_id))
            .ok_or_else(|| unknown_log(directory_id, log_id))?;
        if !log.writable {
            return Err(SequencerError::FailedPrecondition(format!(
                "log {log_id} is not writable"
            )));
        }
        log.payloads.push(payload);
        Ok(log.payloads.len() as Watermark)
    }
}

#[async_trait]
impl LogReader for InMemoryMutationLog {
    async fn list_sources(&self, directory_id: &DirectoryId) -> Result<Vec<LogId>> {
        Ok(self
            .logs
            .read()
            .await
            .get(directory_id)
            .map(|d| {
                d.iter()
                    .filter(|(_, log)| log.writable)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn high_watermark(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        after: Watermark,
        max_items: u64,
    ) -> Result<(u64, Watermark)> {
        let logs = self.logs.read().await;
        let len = logs
            .get(directory_id)
            .and_then(|d| d.get(&log_id))
            .map(|log| log.payloads.len())
            .unwrap_or(0);

        let available = (len as u64).saturating_sub(after);
        let count = available.min(max_items);
        Ok((count, after + count))
    }

    async fn read_range(
        &self,
        directory_id: &DirectoryId,
        log_id: LogId,
        low: Watermark,
        high: Watermark,
        page_size: u64,
    ) -> Result<Vec<LogMessage>> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(directory_id).and_then(|d| d.get(&log_id)) else {
            return Ok(Vec::new());
        };

        let start = clamp(low, log.payloads.len());
        let end = clamp(high, log.payloads.len());
        let take = usize::try_from(page_size).unwrap_or(usize::MAX);

        Ok(log.payloads[start..end.max(start)]
            .iter()
            .take(take)
            .enumerate()
            .map(|(i, payload)| LogMessage::new(log_id, (start + i + 1) as Watermark, payload.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watermarks_start_at_one() {
        let log = InMemoryMutationLog::new();
        let dir = DirectoryId::new("d");
        log.create_log(&dir, LogId::new(0)).await;
        assert_eq!(log.send(&dir, LogId::new(0), b"a".to_vec()).await.unwrap(), 1);
        assert_eq!(log.send(&dir, LogId::new(0), b"b".to_vec()).await.unwrap(), 2);
        assert!(log.send(&dir, LogId::new(9), b"c".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_high_watermark_and_paged_reads() {
        let log = InMemoryMutationLog::new();
        let dir = DirectoryId::new("d");
        let id = LogId::new(1);
        log.create_log(&dir, id).await;
        for i in 0..5u8 {
            log.send(&dir, id, vec![i]).await.unwrap();
        }

        assert_eq!(log.high_watermark(&dir, id, 0, 3).await.unwrap(), (3, 3));
        assert_eq!(log.high_watermark(&dir, id, 3, 10).await.unwrap(), (2, 5));
        assert_eq!(log.high_watermark(&dir, id, 5, 10).await.unwrap(), (0, 5));

        let page = log.read_range(&dir, id, 1, 5, 2).await.unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(page[0].payload, vec![1]);
        assert!(log.read_range(&dir, id, 5, 5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_logs_are_not_sources() {
        let log = InMemoryMutationLog::new();
        let dir = DirectoryId::new("d");
        log.create_log(&dir, LogId::new(2)).await;
        log.create_log(&dir, LogId::new(1)).await;
        assert_eq!(
            log.list_sources(&dir).await.unwrap(),
            vec![LogId::new(1), LogId::new(2)]
        );

        log.set_writable(&dir, LogId::new(1), false).await.unwrap();
        assert_eq!(log.list_sources(&dir).await.unwrap(), vec![LogId::new(2)]);
        assert!(matches!(
            log.send(&dir, LogId::new(1), vec![]).await,
            Err(SequencerError::FailedPrecondition(_))
        ));
    }
}
