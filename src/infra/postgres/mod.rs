//! PostgreSQL implementations for production storage
//!
//! Provides the mutation logs and the batch definition store. Both create
//! their tables with `initialize()`.

mod batch_store;
mod mutation_log;

pub use batch_store::*;
pub use mutation_log::*;
