//! In-process backends
//!
//! Used by tests, benchmarks and the server's embedded mode. The map and log
//! services sign their roots with real keys and serve real proofs, so the
//! verifying clients run unchanged against them.

mod batch_store;
mod log_service;
mod map_service;
mod mutation_log;

pub use batch_store::InMemoryBatchStore;
pub use log_service::InMemoryLogService;
pub use map_service::InMemoryMapService;
pub use mutation_log::InMemoryMutationLog;

/// Wall-clock milliseconds for root timestamps
pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
