//! Domain types for the key transparency sequencer
//!
//! - Identifiers (directories, logs, map indices, watermarks)
//! - Batch definitions and read cursors
//! - Mutations, joined candidates and map leaves
//! - Signed map/log roots and their proofs

mod batch;
mod mutation;
mod root;
pub mod types;

pub use batch::*;
pub use mutation::*;
pub use root::*;
pub use types::{
    DirectoryId, Hash256, LogId, MapIndex, PublicKey32, Signature64, Watermark,
    MAX_DIRECTORY_ID_LEN,
};
