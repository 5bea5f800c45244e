//! Cryptographic utilities for the key transparency sequencer
//!
//! Provides:
//! - Domain-separated SHA-256 hashing and signing preimages
//! - RFC 6962 Merkle tree roots, inclusion and consistency proofs
//! - Ed25519 signing for map roots, log roots and entry updates

mod hash;
pub mod merkle;
mod signing;

pub use hash::*;
pub use signing::*;
