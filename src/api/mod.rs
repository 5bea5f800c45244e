//! HTTP API for the key transparency sequencer
//!
//! REST endpoints driving the sequencer steps and exposing batch definitions
//! and consumed mutations for audit.

mod error;
mod rest;

pub use error::*;
pub use rest::*;
