//! # seisync-core
//!
//! Core types, traits, and abstractions for seisync.
//!
//! This crate provides the data model shared by the SEI client, the state
//! store implementations and the fetch pipelines: work items, per-stage
//! pipeline status, fetched payloads, and the repository traits that make
//! up the State Store.

pub mod defaults;
pub mod error;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
