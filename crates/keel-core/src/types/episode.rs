//! Episodes: immutable checkpoint records sealed at milestones.

use serde::{Deserialize, Serialize};

use crate::ids::{EpisodeId, MemoryId, RunId};
use crate::types::ws::WorkingSet;

/// Inclusive range of ledger sequence ids covered by an episode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerSpan {
    /// First covered sequence id.
    pub from_seq: u64,
    /// Last covered sequence id (the `EPISODE_SEALED` event itself).
    pub to_seq: u64,
}

/// An immutable episode document at `episodes/<episode_id>.json`.
///
/// Working sets are embedded by value: an episode shares no storage with
/// the live run, so later patches never alter history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Episode {
    /// Always `"2.1"`.
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    /// Unique id.
    pub episode_id: EpisodeId,
    /// Owning run.
    pub run_id: RunId,
    /// Caller-supplied reason for sealing.
    pub reason: String,
    /// ISO-8601 UTC seal time.
    pub created_at: String,
    /// Working set at episode start.
    pub ws_before: WorkingSet,
    /// Working set at seal time (the sealer itself never mutates).
    pub ws_after: WorkingSet,
    /// Ledger events this episode covers, inclusive.
    pub ledger_span: LedgerSpan,
    /// Memory items committed under this episode's token.
    pub committed_memory_ids: Vec<MemoryId>,
    /// Where a resumed run should pick up.
    pub next_entry_point: String,
    /// Deterministic digest of the covered events.
    pub summary: String,
}
