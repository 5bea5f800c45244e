//! Infrastructure layer for the key transparency sequencer
//!
//! Contains trait definitions and implementations for:
//! - Mutation logs and batch definitions (PostgreSQL, in-memory)
//! - Map and log services (in-memory, signed roots with real proofs)
//! - Retry with backoff
//! - Shutdown and cancellation

mod error;
pub mod memory;
pub mod postgres;
mod retry;
mod shutdown;
mod traits;

pub use error::*;
pub use memory::{InMemoryBatchStore, InMemoryLogService, InMemoryMapService, InMemoryMutationLog};
pub use postgres::{PgBatchStore, PgMutationLog};
pub use retry::{is_retryable_db_error, retry_transient, Retry, RetryConfig, RetryResult};
pub use shutdown::{
    os_shutdown_signal, GracefulShutdownConfig, ShutdownCoordinator, ShutdownSignal,
};
pub use traits::*;
