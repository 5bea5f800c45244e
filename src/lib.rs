//! Key Transparency Sequencer Library
//!
//! Turns pending directory mutations into signed, verifiable map revisions
//! and publishes every map root to an append-only log.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (directories, batch definitions, leaves, roots)
//! - [`infra`] - Infrastructure implementations (PostgreSQL, in-memory backends)
//! - [`crypto`] - Cryptographic utilities (hashing, Merkle proofs, signing)
//! - [`clients`] - Verifying clients for the map and log services
//! - [`sequencer`] - Batch definition, revision building and publishing
//! - [`metrics`] - Observability and metrics
//! - [`telemetry`] - Logging, distributed tracing and OpenTelemetry integration
//! - [`api`] - REST API routes

pub mod api;
pub mod clients;
pub mod crypto;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod sequencer;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    DirectoryId, Hash256, LogId, LogMessage, MapIndex, MapLeaf, MapMetadata, SignedEntry,
    SignedLogRoot, SignedMapRoot, SourceSlice, Watermark,
};

pub use infra::{
    BatchStore, LogReader, LogService, MapService, MutationQueue, MutationResolver, Result,
    SequencerError,
};

pub use sequencer::{Sequencer, SequencerConfig, StepOutcome, VersionedEntryResolver};
