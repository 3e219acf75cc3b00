//! The persisted data model.
//!
//! Every document that touches disk is a strict struct: unknown fields are
//! rejected at parse time (`deny_unknown_fields`), enum values are closed,
//! and `_schema_version` is stamped on everything. Nothing past the
//! validator traffics in open maps.

pub mod episode;
pub mod ledger;
pub mod memory;
pub mod pack;
pub mod ws;

pub use episode::{Episode, LedgerSpan};
pub use ledger::{EventType, LedgerEvent};
pub use memory::{
    Mcr, McrOp, MemoryHit, MemoryItem, MemoryScope, MemoryStatus, MemoryType, ScopeFilters,
};
pub use pack::{FileDigest, PackManifest};
pub use ws::{ContextItem, WorkingSet, WsPatch, WsPatchSet, WsStatus};
