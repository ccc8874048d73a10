//! # seisync-jobs
//!
//! Batch scheduling and fetch pipelines for seisync.
//!
//! This crate provides:
//! - A bounded-concurrency [`BatchScheduler`] with a cooperative stop
//!   signal and broadcast events
//! - The per-stage claim/fetch/persist lifecycle ([`stage::drive`])
//! - The metadata pipeline (process, documents listing, activities)
//! - The document download pipeline
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use seisync_jobs::{MetadataPipeline, SchedulerConfig, StopHandle, WorkQuery};
//!
//! let pipeline = MetadataPipeline::new(client, store, SchedulerConfig::from_env(), StopHandle::new());
//! let summary = pipeline.run(&WorkQuery::all_stages().with_scope("SEAD-PI")).await?;
//! println!("{} completed, {} left", summary.completed, summary.remaining);
//! ```

pub mod config;
pub mod documents;
pub mod handler;
pub mod metadata;
pub mod scheduler;
pub mod selector;
pub mod stage;

// Re-export core types
pub use seisync_core::*;

pub use config::SchedulerConfig;
pub use documents::{DocumentPipeline, DocumentWorker};
pub use handler::{ItemOutcome, ItemWorker};
pub use metadata::{MetadataPipeline, MetadataWorker};
pub use scheduler::{BatchScheduler, BatchSummary, SchedulerEvent, StopHandle};
pub use selector::{Selection, WorkSelector};
pub use stage::{StageOutcome, StagePayload};
