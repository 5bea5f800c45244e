//! Sequencer core
//!
//! Turns pending mutations into signed map revisions and publishes their
//! roots:
//!
//! 1. `high_watermarks` observes how far each mutation log has grown
//! 2. `Sequencer::run_batch` records a batch definition for the next revision
//! 3. `RevisionBuilder` applies the defined windows to the map
//! 4. `Sequencer::publish_batch` appends new map roots to the root log
//!
//! `SequencerWorker` drives these steps periodically for a directory list.
//!
//! # Configuration
//!
//! - `SEQUENCER_DIRECTORIES` - Comma-separated directories to drive (default: `default`)
//! - `SEQUENCER_MIN_BATCH` - Minimum pending mutations before a revision is defined (default: 1)
//! - `SEQUENCER_MAX_BATCH` - Maximum mutations per revision (default: 1000)
//! - `SEQUENCER_BATCH_INTERVAL_MS` - Tick interval of the worker (default: 1000)
//! - `SEQUENCER_PAGE_SIZE` - Log read page size (default: 500)
//! - `SEQUENCER_PUBLISH_TIMEOUT_SECS` - Bound on waiting for root inclusion (default: 30)

mod builder;
mod orchestrator;
mod pagination;
mod resolver;
mod watermark;
mod worker;

pub use builder::*;
pub use orchestrator::*;
pub use pagination::*;
pub use resolver::*;
pub use watermark::*;
pub use worker::*;

use std::time::Duration;

use crate::domain::DirectoryId;

/// Configuration shared by the orchestrator and the periodic worker
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Directories driven by the worker
    pub directories: Vec<DirectoryId>,
    /// Admission threshold for defining a revision
    pub min_batch: u64,
    /// Upper bound on mutations consumed per revision
    pub max_batch: u64,
    /// How often the worker runs a pass
    pub batch_interval: Duration,
    /// Messages per log read
    pub page_size: u64,
    /// How long `publish_batch` waits for the newest root to be included
    pub publish_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            directories: vec![DirectoryId::new("default")],
            min_batch: 1,
            max_batch: 1000,
            batch_interval: Duration::from_millis(1000),
            page_size: 500,
            publish_timeout: Duration::from_secs(30),
        }
    }
}

impl SequencerConfig {
    /// Load configuration from environment
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let directories = std::env::var("SEQUENCER_DIRECTORIES")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .filter_map(|d| DirectoryId::parse(d).ok())
                    .collect::<Vec<_>>()
            })
            .filter(|dirs| !dirs.is_empty())
            .unwrap_or(defaults.directories);

        let min_batch = std::env::var("SEQUENCER_MIN_BATCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.min_batch);

        let max_batch = std::env::var("SEQUENCER_MAX_BATCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_batch);

        let batch_interval = std::env::var("SEQUENCER_BATCH_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.batch_interval);

        let page_size = std::env::var("SEQUENCER_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &u64| *n > 0)
            .unwrap_or(defaults.page_size);

        let publish_timeout = std::env::var("SEQUENCER_PUBLISH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.publish_timeout);

        Self {
            directories,
            min_batch,
            max_batch,
            batch_interval,
            page_size,
            publish_timeout,
        }
    }

    pub fn with_directories(mut self, directories: Vec<DirectoryId>) -> Self {
        self.directories = directories;
        self
    }

    pub fn with_batch_bounds(mut self, min_batch: u64, max_batch: u64) -> Self {
        self.min_batch = min_batch;
        self.max_batch = max_batch;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SequencerConfig::default();
        assert_eq!(config.min_batch, 1);
        assert_eq!(config.max_batch, 1000);
        assert_eq!(config.page_size, 500);
        assert_eq!(config.directories, vec![DirectoryId::new("default")]);
    }

    #[test]
    fn test_page_size_never_zero() {
        let config = SequencerConfig::default().with_page_size(0);
        assert_eq!(config.page_size, 1);
    }
}
