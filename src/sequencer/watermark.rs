use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::domain::{DirectoryId, LogId, Watermark};
use crate::infra::{LogReader, Result, SequencerError};

/// Observe how far each writable log of a directory can advance.
///
/// Sources are visited in ascending id order and share one budget of
/// `max_items`: each source may consume whatever the earlier ones left.
/// Sources missing from `start` begin at the origin. Logs present in `start`
/// but no longer listed keep their start watermark. Nothing is consumed.
#[instrument(skip(reader, start), fields(directory_id = %directory_id, sources = start.len()))]
pub async fn high_watermarks(
    reader: &dyn LogReader,
    directory_id: &DirectoryId,
    start: &BTreeMap<LogId, Watermark>,
    max_items: u64,
) -> Result<(u64, BTreeMap<LogId, Watermark>)> {
    let mut sources = reader.list_sources(directory_id).await?;
    sources.sort();
    sources.dedup();

    let mut ends = start.clone();
    let mut total = 0u64;
    let mut remaining = max_items;

    for log_id in sources {
        let low = start.get(&log_id).copied().unwrap_or(0);
        if remaining == 0 {
            ends.entry(log_id).or_insert(low);
            continue;
        }

        let (count, high) = reader
            .high_watermark(directory_id, log_id, low, remaining)
            .await?;
        if high < low || count > remaining || (count == 0 && high != low) {
            return Err(SequencerError::IntegrityViolation(format!(
                "log {log_id} reported {count} items up to {high} after {low} with budget {remaining}"
            )));
        }

        debug!(log_id = %log_id, low, high, count, "Observed log source");
        ends.insert(log_id, high);
        total += count;
        remaining -= count;
    }

    Ok((total, ends))
}
