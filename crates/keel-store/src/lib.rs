//! # keel-store
//!
//! The durable machinery behind a run:
//!
//! - **fsio**: atomic whole-file writes (temp + fsync + rename) and synced
//!   append handles with optional advisory locking
//! - **ledger**: the append-only JSONL event log with dense sequence ids
//! - **ws**: the working-set manager — optimistic concurrency, ordered
//!   patch directives, deterministic token-budget eviction
//! - **memory**: the two-phase long-term memory store behind the
//!   [`memory::MemoryBackend`] trait
//! - **episode**: immutable milestone checkpoints
//! - **pack**: content-addressed resume packs, snapshot and restore
//!
//! Crash safety is rename-based: every persisted document is either the
//! prior content or the new content, never partial.

#![deny(unsafe_code)]

pub mod episode;
pub mod fsio;
pub mod ledger;
pub mod memory;
pub mod pack;
pub mod ws;

pub use fsio::{AppendHandle, LockMode};
pub use ledger::{LedgerError, RunLedger};
pub use memory::{InMemoryStore, MemoryBackend, MemoryError, ProposeReceipt, SearchQuery};
pub use ws::{AppliedPatch, WorkingSetManager, WsError};
