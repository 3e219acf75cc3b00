//! Working set: the live, mutable task-state document for one run.

use serde::{Deserialize, Serialize};

use crate::ids::{RunId, TaskId, ThreadId};
use crate::SCHEMA_VERSION;

/// Execution status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WsStatus {
    /// Initial state after `boot`.
    #[serde(rename = "BOOT")]
    Boot,
    /// Actively working a step.
    #[serde(rename = "BUSY")]
    Busy,
    /// Waiting between steps.
    #[serde(rename = "IDLE")]
    Idle,
    /// Objective met.
    #[serde(rename = "DONE")]
    Done,
    /// Terminally failed.
    #[serde(rename = "FAILED")]
    Failed,
}

impl WsStatus {
    /// The wire string for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::Busy => "BUSY",
            Self::Idle => "IDLE",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

/// One unit of context carried by the working set.
///
/// `id` is unique across pinned and sliding context. `priority` orders
/// eviction (higher = retain). `tokens`, when present, is a precomputed
/// estimate that short-circuits re-estimation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextItem {
    /// Unique id within the working set.
    pub id: String,
    /// The context text itself.
    pub content: String,
    /// ISO-8601 UTC creation time; the eviction tie-break.
    pub timestamp: String,
    /// Retention priority; higher values are evicted last.
    pub priority: i64,
    /// Precomputed token estimate, if the caller already counted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

/// The working-set document persisted at `state/working_set.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkingSet {
    /// Always `"2.1"`.
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    /// Monotonic version counter; increments by exactly 1 per applied patch.
    #[serde(rename = "_update_seq")]
    pub update_seq: u64,
    /// Owning run.
    pub run_id: RunId,
    /// Task this run serves.
    pub task_id: TaskId,
    /// Conversation thread this run serves.
    pub thread_id: ThreadId,
    /// What the run is trying to accomplish. Immutable after boot.
    pub objective: String,
    /// Ordered acceptance criteria.
    pub acceptance_criteria: Vec<String>,
    /// Ordered constraints.
    pub constraints: Vec<String>,
    /// Execution status.
    pub status: WsStatus,
    /// Free-form stage label.
    pub current_stage: String,
    /// What the run intends to do next.
    pub next_action: String,
    /// Context items never evicted; capped at `pinned_max`.
    pub pinned_context: Vec<ContextItem>,
    /// Context items subject to deterministic eviction.
    pub sliding_context: Vec<ContextItem>,
}

impl WorkingSet {
    /// Build the initial document for a freshly booted run.
    ///
    /// `_update_seq` starts at 0, status and stage start at BOOT, both
    /// context lists start empty.
    #[must_use]
    pub fn initial(
        run_id: RunId,
        task_id: TaskId,
        thread_id: ThreadId,
        objective: String,
        acceptance_criteria: Vec<String>,
        constraints: Vec<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            update_seq: 0,
            run_id,
            task_id,
            thread_id,
            objective,
            acceptance_criteria,
            constraints,
            status: WsStatus::Boot,
            current_stage: "BOOT".to_string(),
            next_action: String::new(),
            pinned_context: Vec::new(),
            sliding_context: Vec::new(),
        }
    }
}

/// Mutable envelope fields a patch may override via `set`.
///
/// Identity fields, `_update_seq`, `_schema_version`, and `objective` are
/// immutable; the strict parse rejects them as unknown keys. The context
/// lists move only through the dedicated append/remove directives.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsPatchSet {
    /// Replace the acceptance criteria.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<Vec<String>>,
    /// Replace the constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Vec<String>>,
    /// Replace the stage label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Replace the next action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    /// Replace the execution status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WsStatus>,
}

/// A working-set patch, applied under optimistic concurrency.
///
/// Directives apply in a fixed order: `set`, `pinned_remove`,
/// `pinned_append`, `sliding_remove`, `sliding_append`; the convenience
/// `status` field applies with `set`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsPatch {
    /// Always `"2.1"`.
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    /// The `_update_seq` the caller read; mismatch rejects the patch.
    pub expected_seq: u64,
    /// Shallow overrides of mutable envelope fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<WsPatchSet>,
    /// Convenience status override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WsStatus>,
    /// Items to add to pinned context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_append: Vec<ContextItem>,
    /// Ids to remove from pinned context; unknown ids are no-ops.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_remove: Vec<String>,
    /// Items to add to sliding context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sliding_append: Vec<ContextItem>,
    /// Ids to remove from sliding context; unknown ids are no-ops.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sliding_remove: Vec<String>,
}

impl WsPatch {
    /// An empty patch against the given sequence.
    #[must_use]
    pub fn against(expected_seq: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            expected_seq,
            set: None,
            status: None,
            pinned_append: Vec::new(),
            pinned_remove: Vec::new(),
            sliding_append: Vec::new(),
            sliding_remove: Vec::new(),
        }
    }

    /// Compact summary of which directives this patch carries, for the
    /// `WS_UPDATE_APPLIED` ledger payload.
    #[must_use]
    pub fn directives_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "set": self.set.is_some() || self.status.is_some(),
            "pinned_append": self.pinned_append.len(),
            "pinned_remove": self.pinned_remove.len(),
            "sliding_append": self.sliding_append.len(),
            "sliding_remove": self.sliding_remove.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ws() -> WorkingSet {
        WorkingSet::initial(
            RunId::from("run_1"),
            TaskId::from("task_1"),
            ThreadId::from("thread_1"),
            "ship it".to_string(),
            vec!["tests pass".to_string()],
            vec![],
        )
    }

    #[test]
    fn initial_ws_starts_at_seq_zero_in_boot() {
        let ws = sample_ws();
        assert_eq!(ws.update_seq, 0);
        assert_eq!(ws.status, WsStatus::Boot);
        assert_eq!(ws.current_stage, "BOOT");
        assert!(ws.pinned_context.is_empty());
        assert!(ws.sliding_context.is_empty());
    }

    #[test]
    fn ws_roundtrips_with_exact_field_names() {
        let ws = sample_ws();
        let value = serde_json::to_value(&ws).unwrap();
        assert_eq!(value["_schema_version"], "2.1");
        assert_eq!(value["_update_seq"], 0);
        assert_eq!(value["status"], "BOOT");
        let back: WorkingSet = serde_json::from_value(value).unwrap();
        assert_eq!(back, ws);
    }

    #[test]
    fn unknown_ws_field_is_rejected() {
        let mut value = serde_json::to_value(sample_ws()).unwrap();
        value["surprise"] = serde_json::json!(true);
        assert!(serde_json::from_value::<WorkingSet>(value).is_err());
    }

    #[test]
    fn set_rejects_immutable_objective() {
        let raw = serde_json::json!({
            "_schema_version": "2.1",
            "expected_seq": 0,
            "set": { "objective": "rewritten" },
        });
        assert!(serde_json::from_value::<WsPatch>(raw).is_err());
    }

    #[test]
    fn patch_defaults_to_no_directives() {
        let raw = serde_json::json!({ "_schema_version": "2.1", "expected_seq": 3 });
        let patch: WsPatch = serde_json::from_value(raw).unwrap();
        assert_eq!(patch.expected_seq, 3);
        assert!(patch.set.is_none());
        assert!(patch.sliding_append.is_empty());
    }

    #[test]
    fn directives_summary_counts_each_kind() {
        let mut patch = WsPatch::against(0);
        patch.status = Some(WsStatus::Busy);
        patch.sliding_remove = vec!["a".to_string(), "b".to_string()];
        let summary = patch.directives_summary();
        assert_eq!(summary["set"], true);
        assert_eq!(summary["sliding_remove"], 2);
        assert_eq!(summary["pinned_append"], 0);
    }
}
