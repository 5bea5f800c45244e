use serde::Serialize;
use tracing::instrument;

use crate::domain::{DirectoryId, LogMessage, ReadToken, SourceSlice};
use crate::infra::{BatchStore, LogReader, Result, SequencerError};

/// One page of the mutations consumed by a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationPage {
    pub revision: u64,
    pub messages: Vec<LogMessage>,
    /// Empty when there are no more pages
    pub next_page_token: String,
}

/// Page through the mutations a revision consumed, slice by slice in
/// ascending log order.
///
/// `page_token` is empty for the first page, otherwise the
/// `next_page_token` of the previous page.
#[instrument(skip(reader, batches, page_token), fields(directory_id = %directory_id))]
pub async fn read_revision_mutations(
    reader: &dyn LogReader,
    batches: &dyn BatchStore,
    directory_id: &DirectoryId,
    revision: u64,
    page_token: &str,
    page_size: u64,
) -> Result<MutationPage> {
    if page_size == 0 {
        return Err(SequencerError::InvalidArgument(
            "page size must be at least 1".to_string(),
        ));
    }

    let definition = batches.read_batch(directory_id, revision).await?;
    let slices: Vec<SourceSlice> = definition.sources.values().copied().collect();

    let token = ReadToken::decode(page_token).map_err(SequencerError::InvalidArgument)?;
    let (first_shard, mut low) = match token {
        None => (0usize, None),
        Some(token) => {
            let shard = token.shard_id as usize;
            let slice = slices.get(shard).ok_or_else(|| {
                SequencerError::InvalidArgument(format!("page token names unknown shard {shard}"))
            })?;
            if token.low_watermark < slice.lowest_watermark
                || token.low_watermark > slice.highest_watermark
            {
                return Err(SequencerError::InvalidArgument(
                    "page token is outside the revision's window".to_string(),
                ));
            }
            (shard, Some(token.low_watermark))
        }
    };

    let mut messages = Vec::new();
    for (shard, slice) in slices.iter().enumerate().skip(first_shard) {
        let start = low.take().unwrap_or(slice.lowest_watermark);
        let remaining = page_size - messages.len() as u64;

        let page = reader
            .read_range(
                directory_id,
                slice.log_id,
                start,
                slice.highest_watermark,
                remaining,
            )
            .await?;
        let filled = page.len() as u64 >= remaining;
        let last = page.last().map(|m| m.id);
        messages.extend(page);

        if filled {
            let next = match last {
                Some(id) if id < slice.highest_watermark => {
                    Some(ReadToken::new(shard as u32, id))
                }
                _ => slices
                    .get(shard + 1)
                    .map(|s| ReadToken::new(shard as u32 + 1, s.lowest_watermark)),
            };
            return Ok(MutationPage {
                revision,
                messages,
                next_page_token: next.map(|t| t.encode()).unwrap_or_default(),
            });
        }
    }

    Ok(MutationPage {
        revision,
        messages,
        next_page_token: String::new(),
    })
}
