//! Ledger events: one append-only record per thing that happened to a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, RunId};
use crate::SCHEMA_VERSION;

/// Closed set of ledger event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Run created; first event of every ledger.
    #[serde(rename = "BOOT")]
    Boot,
    /// A working-set patch was applied.
    #[serde(rename = "WS_UPDATE_APPLIED")]
    WsUpdateApplied,
    /// A working-set patch was rejected (conflict, schema, or a failed
    /// episode commit).
    #[serde(rename = "WS_UPDATE_REJECTED")]
    WsUpdateRejected,
    /// Memory change requests were staged.
    #[serde(rename = "MEMORY_PROPOSED")]
    MemoryProposed,
    /// A staged batch was committed.
    #[serde(rename = "MEMORY_COMMITTED")]
    MemoryCommitted,
    /// An episode checkpoint was sealed.
    #[serde(rename = "EPISODE_SEALED")]
    EpisodeSealed,
    /// A resume pack was snapshotted.
    #[serde(rename = "RESUME_SNAPSHOT")]
    ResumeSnapshot,
    /// A run was reconstituted from a resume pack.
    #[serde(rename = "RESUME_LOADED")]
    ResumeLoaded,
}

impl EventType {
    /// The wire string for this event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::WsUpdateApplied => "WS_UPDATE_APPLIED",
            Self::WsUpdateRejected => "WS_UPDATE_REJECTED",
            Self::MemoryProposed => "MEMORY_PROPOSED",
            Self::MemoryCommitted => "MEMORY_COMMITTED",
            Self::EpisodeSealed => "EPISODE_SEALED",
            Self::ResumeSnapshot => "RESUME_SNAPSHOT",
            Self::ResumeLoaded => "RESUME_LOADED",
        }
    }
}

/// One ledger line. Sequence ids are dense from 0 within a run; lines are
/// never rewritten.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerEvent {
    /// Always `"2.1"`.
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    /// Dense, strictly increasing position in the run's ledger.
    pub sequence_id: u64,
    /// Opaque unique id.
    pub event_id: EventId,
    /// What happened.
    pub event_type: EventType,
    /// ISO-8601 UTC time of the append.
    pub timestamp: String,
    /// The run this event belongs to.
    pub run_id: RunId,
    /// Event-specific payload.
    pub payload: Value,
}

impl LedgerEvent {
    /// Build an event at a known sequence position.
    #[must_use]
    pub fn at(sequence_id: u64, event_type: EventType, run_id: RunId, payload: Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            sequence_id,
            event_id: EventId::mint(),
            event_type,
            timestamp: crate::time::now_iso(),
            run_id,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_to_wire_strings() {
        for (ty, wire) in [
            (EventType::Boot, "\"BOOT\""),
            (EventType::WsUpdateApplied, "\"WS_UPDATE_APPLIED\""),
            (EventType::EpisodeSealed, "\"EPISODE_SEALED\""),
            (EventType::ResumeLoaded, "\"RESUME_LOADED\""),
        ] {
            assert_eq!(serde_json::to_string(&ty).unwrap(), wire);
            assert_eq!(format!("\"{}\"", ty.as_str()), wire);
        }
    }

    #[test]
    fn event_roundtrips() {
        let event = LedgerEvent::at(
            7,
            EventType::MemoryProposed,
            RunId::from("run_1"),
            serde_json::json!({ "batch_id": "batch_1", "count": 2 }),
        );
        let line = serde_json::to_string(&event).unwrap();
        let back: LedgerEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.sequence_id, 7);
    }

    #[test]
    fn unknown_event_field_is_rejected() {
        let raw = serde_json::json!({
            "_schema_version": "2.1",
            "sequence_id": 0,
            "event_id": "evt_1",
            "event_type": "BOOT",
            "timestamp": "2026-01-01T00:00:00.000000Z",
            "run_id": "run_1",
            "payload": {},
            "extra": 1,
        });
        assert!(serde_json::from_value::<LedgerEvent>(raw).is_err());
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!(serde_json::from_str::<EventType>("\"COMPACTION\"").is_err());
    }
}
