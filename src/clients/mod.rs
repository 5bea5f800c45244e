//! Verifying clients for the map and log services
//!
//! Nothing a backend returns reaches the sequencer unverified: root
//! signatures, log consistency, leaf inclusion and absence proofs are all
//! checked here. Failures surface as `SequencerError::Verification`.

mod log;
mod map;

pub use log::VerifyingLogClient;
pub use map::{verify_leaf_proof, VerifyingMapClient};
