//! # keel-core
//!
//! Shared vocabulary for the Keel run-state engine.
//!
//! - **IDs**: branded newtypes for every entity (runs, events, episodes,
//!   batches, memories, packs, milestone tokens)
//! - **Types**: the persisted data model — working sets, ledger events,
//!   memory items, episodes, resume-pack manifests — all parsed strictly
//! - **Validation**: typed parsing of untrusted documents with
//!   pointer-and-message errors
//! - **Token estimation**: the single deterministic estimator used by
//!   eviction and the context brief
//! - **Context brief**: pure, reproducible markdown rendering of a run's
//!   working state

#![deny(unsafe_code)]

pub mod brief;
pub mod error;
pub mod estimate;
pub mod ids;
pub mod logging;
pub mod time;
pub mod types;
pub mod validate;

pub use error::ErrorKind;
pub use ids::{
    BatchId, EpisodeId, EventId, MemoryId, MilestoneToken, PackId, RunId, TaskId, ThreadId,
};
pub use validate::{ValidationError, ValidationResult};

/// Schema version stamped on every persisted document.
pub const SCHEMA_VERSION: &str = "2.1";
