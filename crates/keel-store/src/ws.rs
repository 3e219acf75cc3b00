//! The working-set manager.
//!
//! One JSON document per run at `state/working_set.json`, updated under
//! optimistic concurrency: every patch names the `_update_seq` it read,
//! and exactly one of two racing patches against the same sequence wins.
//! Patches apply their directives in a fixed order, then deterministic
//! eviction trims sliding context until the token budget holds.
//!
//! Callers serialize access through the per-run mutex owned by the
//! runtime; this type performs the disk re-read that makes the
//! compare-and-set safe even if they don't.

use std::io;
use std::path::PathBuf;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use keel_core::estimate::document_tokens;
use keel_core::types::{ContextItem, EventType, WorkingSet, WsPatch};
use keel_core::{validate, ValidationError};

use crate::fsio::write_atomic;
use crate::ledger::{LedgerError, RunLedger};

/// Errors from working-set operations.
#[derive(Debug, Error)]
pub enum WsError {
    /// `create_initial` found an existing document.
    #[error("working set already exists")]
    AlreadyExists,

    /// No working set on disk.
    #[error("working set not found")]
    NotFound,

    /// Underlying filesystem failure.
    #[error("working set io: {0}")]
    Io(#[from] io::Error),

    /// The document or patch failed validation.
    #[error("working set schema: {0}")]
    Schema(#[from] ValidationError),

    /// `expected_seq` did not match the current `_update_seq`.
    #[error("stale patch: current _update_seq is {current_seq}")]
    Conflict {
        /// The sequence the caller must re-read.
        current_seq: u64,
    },

    /// An appended context item reused an existing id.
    #[error("duplicate context item id {id:?}")]
    DuplicateItem {
        /// The offending id.
        id: String,
    },

    /// The pinned-context cap was exceeded.
    #[error("pinned context holds {count} items, cap is {max}")]
    PinnedOverflow {
        /// Items after the patch.
        count: usize,
        /// Configured cap.
        max: usize,
    },

    /// Even an empty sliding context cannot satisfy the budget.
    #[error("working set needs {tokens} tokens, budget is {budget}")]
    BudgetExceeded {
        /// Estimated tokens after evicting everything evictable.
        tokens: u64,
        /// Configured budget.
        budget: u64,
    },

    /// The ledger refused an append.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Result alias for working-set operations.
pub type Result<T> = std::result::Result<T, WsError>;

/// Outcome of a successfully applied patch.
#[derive(Debug)]
pub struct AppliedPatch {
    /// The new working set, already durable.
    pub ws: WorkingSet,
    /// Ids evicted from sliding context to satisfy the budget.
    pub evicted: Vec<String>,
}

/// Manages one run's working-set document.
pub struct WorkingSetManager {
    ws_path: PathBuf,
    token_budget: u64,
    pinned_max: usize,
}

impl WorkingSetManager {
    /// Create a manager for the document at `ws_path`.
    #[must_use]
    pub fn new(ws_path: PathBuf, token_budget: u64, pinned_max: usize) -> Self {
        Self { ws_path, token_budget, pinned_max }
    }

    /// Whether a working set exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.ws_path.exists()
    }

    /// Persist the initial document for a fresh run and record `BOOT`.
    ///
    /// Refuses if a working set already exists.
    pub fn create_initial(&self, ws: WorkingSet, ledger: &RunLedger) -> Result<WorkingSet> {
        if self.exists() {
            return Err(WsError::AlreadyExists);
        }
        let ws = validate::working_set(&serde_json::to_value(&ws).map_err(into_io)?)?;
        self.persist(&ws)?;
        ledger.append(
            EventType::Boot,
            json!({
                "task_id": ws.task_id,
                "thread_id": ws.thread_id,
                "objective": ws.objective,
            }),
        )?;
        Ok(ws)
    }

    /// Read and validate the document.
    pub fn load(&self) -> Result<WorkingSet> {
        if !self.exists() {
            return Err(WsError::NotFound);
        }
        let bytes = std::fs::read(&self.ws_path)?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ValidationError::at("/", format!("invalid json: {e}")))?;
        Ok(validate::working_set(&value)?)
    }

    /// Read the document and cross-check it against the ledger.
    ///
    /// A crash between the atomic WS write and the ledger append leaves the
    /// two out of step; the discrepancy is flagged, never auto-repaired.
    /// The WS file remains the source of truth.
    pub fn load_and_reconcile(&self, ledger: &RunLedger) -> Result<WorkingSet> {
        let ws = self.load()?;
        let mut max_ledger_seq: Option<u64> = None;
        for event in ledger.read_all()? {
            let event = event?;
            if event.event_type == EventType::WsUpdateApplied {
                if let Some(after) = event.payload.get("after_seq").and_then(Value::as_u64) {
                    max_ledger_seq = Some(max_ledger_seq.map_or(after, |m| m.max(after)));
                }
            }
        }
        if let Some(max_seq) = max_ledger_seq {
            if ws.update_seq < max_seq {
                warn!(
                    ws_seq = ws.update_seq,
                    ledger_seq = max_seq,
                    path = %self.ws_path.display(),
                    "ledger ahead of working set; trusting the working-set file"
                );
            }
        }
        Ok(ws)
    }

    /// Apply a patch under optimistic concurrency.
    ///
    /// Order of operations: re-read from disk, compare-and-set on
    /// `expected_seq`, strict patch validation, directives in the order
    /// `set → pinned_remove → pinned_append → sliding_remove →
    /// sliding_append`, pinned cap, deterministic eviction, atomic
    /// persist, `WS_UPDATE_APPLIED` ledger event.
    ///
    /// Conflict and schema rejections are themselves ledgered as
    /// `WS_UPDATE_REJECTED`. Later failures leave the prior document
    /// intact and nothing ledgered.
    pub fn apply_patch(&self, patch_doc: &Value, ledger: &RunLedger) -> Result<AppliedPatch> {
        let current = self.load()?;

        // The CAS comes before full validation, so a stale patch reports
        // conflict even when it is also malformed.
        let Some(expected_seq) = patch_doc.get("expected_seq").and_then(Value::as_u64) else {
            let error = ValidationError::at("/expected_seq", "expected_seq must be an unsigned integer");
            ledger.append(
                EventType::WsUpdateRejected,
                json!({ "reason": "schema", "error": error.to_string() }),
            )?;
            return Err(error.into());
        };
        if expected_seq != current.update_seq {
            ledger.append(
                EventType::WsUpdateRejected,
                json!({
                    "reason": "conflict",
                    "expected_seq": expected_seq,
                    "current_seq": current.update_seq,
                }),
            )?;
            return Err(WsError::Conflict { current_seq: current.update_seq });
        }

        let patch = match validate::ws_patch(patch_doc) {
            Ok(patch) => patch,
            Err(error) => {
                ledger.append(
                    EventType::WsUpdateRejected,
                    json!({ "reason": "schema", "error": error.to_string() }),
                )?;
                return Err(error.into());
            }
        };

        let mut new_ws = current.clone();
        self.apply_directives(&mut new_ws, &patch)?;

        if new_ws.pinned_context.len() > self.pinned_max {
            return Err(WsError::PinnedOverflow {
                count: new_ws.pinned_context.len(),
                max: self.pinned_max,
            });
        }

        let evicted = self.evict(&mut new_ws)?;

        new_ws.update_seq = current.update_seq + 1;
        self.persist(&new_ws)?;

        // A failure past this point leaves the WS durable but unledgered;
        // load_and_reconcile flags the discrepancy on the next open.
        if let Err(e) = ledger.append(
            EventType::WsUpdateApplied,
            json!({
                "before_seq": current.update_seq,
                "after_seq": new_ws.update_seq,
                "directives_summary": patch.directives_summary(),
                "evicted": evicted,
            }),
        ) {
            warn!(error = %e, "working set persisted but ledger append failed");
        }

        Ok(AppliedPatch { ws: new_ws, evicted })
    }

    fn apply_directives(&self, ws: &mut WorkingSet, patch: &WsPatch) -> Result<()> {
        if let Some(set) = &patch.set {
            if let Some(ac) = &set.acceptance_criteria {
                ws.acceptance_criteria = ac.clone();
            }
            if let Some(constraints) = &set.constraints {
                ws.constraints = constraints.clone();
            }
            if let Some(stage) = &set.current_stage {
                ws.current_stage = stage.clone();
            }
            if let Some(next) = &set.next_action {
                ws.next_action = next.clone();
            }
            if let Some(status) = set.status {
                ws.status = status;
            }
        }
        if let Some(status) = patch.status {
            ws.status = status;
        }

        ws.pinned_context.retain(|item| !patch.pinned_remove.contains(&item.id));
        for item in &patch.pinned_append {
            Self::append_item(&mut ws.pinned_context, &ws.sliding_context, item)?;
        }

        ws.sliding_context.retain(|item| !patch.sliding_remove.contains(&item.id));
        for item in &patch.sliding_append {
            Self::append_item(&mut ws.sliding_context, &ws.pinned_context, item)?;
        }
        Ok(())
    }

    fn append_item(
        target: &mut Vec<ContextItem>,
        other: &[ContextItem],
        item: &ContextItem,
    ) -> Result<()> {
        if target.iter().chain(other.iter()).any(|existing| existing.id == item.id) {
            return Err(WsError::DuplicateItem { id: item.id.clone() });
        }
        target.push(item.clone());
        Ok(())
    }

    /// Evict sliding items until the document fits the budget.
    ///
    /// Candidates leave in `(priority ASC, timestamp ASC, id ASC)` order;
    /// the tie-break is total, so identical inputs evict identically.
    /// Pinned context is never touched.
    fn evict(&self, ws: &mut WorkingSet) -> Result<Vec<String>> {
        let mut queue = ws.sliding_context.clone();
        queue.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut evicted = Vec::new();
        let mut next_victim = 0;
        while document_tokens(ws) > self.token_budget {
            let Some(victim) = queue.get(next_victim) else {
                return Err(WsError::BudgetExceeded {
                    tokens: document_tokens(ws),
                    budget: self.token_budget,
                });
            };
            ws.sliding_context.retain(|item| item.id != victim.id);
            evicted.push(victim.id.clone());
            next_victim += 1;
        }
        Ok(evicted)
    }

    fn persist(&self, ws: &WorkingSet) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(ws).map_err(into_io)?;
        bytes.push(b'\n');
        write_atomic(&self.ws_path, &bytes)?;
        Ok(())
    }
}

fn into_io(e: serde_json::Error) -> WsError {
    WsError::Io(io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ids::{RunId, TaskId, ThreadId};
    use keel_core::types::WsStatus;

    use crate::fsio::LockMode;

    fn setup(budget: u64) -> (tempfile::TempDir, WorkingSetManager, RunLedger) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkingSetManager::new(dir.path().join("state/working_set.json"), budget, 32);
        let ledger = RunLedger::open(
            &dir.path().join("ledger/run.jsonl"),
            RunId::from("run_1"),
            LockMode::None,
        )
        .unwrap();
        (dir, manager, ledger)
    }

    fn boot(manager: &WorkingSetManager, ledger: &RunLedger, objective: &str) -> WorkingSet {
        manager
            .create_initial(
                WorkingSet::initial(
                    RunId::from("run_1"),
                    TaskId::from("task_1"),
                    ThreadId::from("thread_1"),
                    objective.to_string(),
                    vec![],
                    vec![],
                ),
                ledger,
            )
            .unwrap()
    }

    fn sliding_item(id: &str, content: &str, priority: i64, ts: &str) -> Value {
        json!({ "id": id, "content": content, "timestamp": ts, "priority": priority })
    }

    #[test]
    fn create_initial_refuses_second_boot() {
        let (_dir, manager, ledger) = setup(8192);
        boot(&manager, &ledger, "obj");
        assert!(matches!(
            manager.create_initial(
                WorkingSet::initial(
                    RunId::from("run_1"),
                    TaskId::from("task_1"),
                    ThreadId::from("thread_1"),
                    "again".to_string(),
                    vec![],
                    vec![],
                ),
                &ledger,
            ),
            Err(WsError::AlreadyExists)
        ));
    }

    #[test]
    fn patch_increments_seq_by_one() {
        let (_dir, manager, ledger) = setup(8192);
        boot(&manager, &ledger, "obj");

        let patch = json!({ "_schema_version": "2.1", "expected_seq": 0, "status": "BUSY" });
        let applied = manager.apply_patch(&patch, &ledger).unwrap();
        assert_eq!(applied.ws.update_seq, 1);
        assert_eq!(applied.ws.status, WsStatus::Busy);

        let reloaded = manager.load().unwrap();
        assert_eq!(reloaded.update_seq, 1);
    }

    #[test]
    fn stale_seq_conflicts_and_is_ledgered() {
        let (_dir, manager, ledger) = setup(8192);
        boot(&manager, &ledger, "obj");

        let patch = json!({ "_schema_version": "2.1", "expected_seq": 0, "status": "BUSY" });
        manager.apply_patch(&patch, &ledger).unwrap();

        let stale = json!({ "_schema_version": "2.1", "expected_seq": 0, "status": "IDLE" });
        match manager.apply_patch(&stale, &ledger).unwrap_err() {
            WsError::Conflict { current_seq } => assert_eq!(current_seq, 1),
            other => panic!("expected conflict, got {other:?}"),
        }

        let events = ledger.collect_all().unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["BOOT", "WS_UPDATE_APPLIED", "WS_UPDATE_REJECTED"]);
        assert_eq!(events[2].payload["reason"], "conflict");
        assert_eq!(events[2].payload["current_seq"], 1);
    }

    #[test]
    fn unknown_patch_field_rejects_with_schema_reason() {
        let (_dir, manager, ledger) = setup(8192);
        boot(&manager, &ledger, "obj");

        let patch = json!({ "_schema_version": "2.1", "expected_seq": 0, "mystery": 1 });
        assert!(matches!(
            manager.apply_patch(&patch, &ledger),
            Err(WsError::Schema(_))
        ));

        let events = ledger.collect_all().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::WsUpdateRejected);
        assert_eq!(last.payload["reason"], "schema");

        // The rejected patch did not bump the sequence.
        assert_eq!(manager.load().unwrap().update_seq, 0);
    }

    #[test]
    fn duplicate_item_id_fails_without_mutating() {
        let (_dir, manager, ledger) = setup(8192);
        boot(&manager, &ledger, "obj");

        let ts = "2026-01-01T00:00:00.000000Z";
        let patch = json!({
            "_schema_version": "2.1",
            "expected_seq": 0,
            "sliding_append": [sliding_item("a", "one", 1, ts)],
        });
        manager.apply_patch(&patch, &ledger).unwrap();

        let dup = json!({
            "_schema_version": "2.1",
            "expected_seq": 1,
            "pinned_append": [sliding_item("a", "two", 1, ts)],
        });
        assert!(matches!(
            manager.apply_patch(&dup, &ledger),
            Err(WsError::DuplicateItem { .. })
        ));
        assert_eq!(manager.load().unwrap().update_seq, 1);
    }

    #[test]
    fn removing_unknown_id_is_a_noop() {
        let (_dir, manager, ledger) = setup(8192);
        boot(&manager, &ledger, "obj");

        let patch = json!({
            "_schema_version": "2.1",
            "expected_seq": 0,
            "sliding_remove": ["ghost"],
        });
        let applied = manager.apply_patch(&patch, &ledger).unwrap();
        assert_eq!(applied.ws.update_seq, 1);
    }

    #[test]
    fn pinned_cap_overflows() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkingSetManager::new(dir.path().join("ws.json"), 8192, 1);
        let ledger = RunLedger::open(
            &dir.path().join("run.jsonl"),
            RunId::from("run_1"),
            LockMode::None,
        )
        .unwrap();
        boot(&manager, &ledger, "obj");

        let ts = "2026-01-01T00:00:00.000000Z";
        let patch = json!({
            "_schema_version": "2.1",
            "expected_seq": 0,
            "pinned_append": [sliding_item("a", "one", 1, ts), sliding_item("b", "two", 1, ts)],
        });
        assert!(matches!(
            manager.apply_patch(&patch, &ledger),
            Err(WsError::PinnedOverflow { count: 2, max: 1 })
        ));
    }

    #[test]
    fn eviction_removes_lowest_priority_oldest_first() {
        // Budget 10, estimator len/4. Objective "A" (1) + status BOOT (1)
        // + stage BOOT (1) = base 3. Three 20-char items at 5 tokens each:
        // 18 > 10, evict A (pri 1, oldest) → 13, evict C (pri 1) → 8. B stays.
        let (_dir, manager, ledger) = setup(10);
        boot(&manager, &ledger, "A");

        let patch = json!({
            "_schema_version": "2.1",
            "expected_seq": 0,
            "sliding_append": [
                sliding_item("A", &"x".repeat(20), 1, "2026-01-01T00:00:01.000000Z"),
                sliding_item("B", &"y".repeat(20), 2, "2026-01-01T00:00:02.000000Z"),
                sliding_item("C", &"z".repeat(20), 1, "2026-01-01T00:00:03.000000Z"),
            ],
        });
        let applied = manager.apply_patch(&patch, &ledger).unwrap();
        let survivors: Vec<&str> =
            applied.ws.sliding_context.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(survivors, vec!["B"]);
        assert_eq!(applied.evicted, vec!["A", "C"]);
    }

    #[test]
    fn eviction_never_touches_pinned() {
        let (_dir, manager, ledger) = setup(10);
        boot(&manager, &ledger, "A");

        let patch = json!({
            "_schema_version": "2.1",
            "expected_seq": 0,
            "pinned_append": [sliding_item("keep", &"p".repeat(20), 0, "2026-01-01T00:00:01.000000Z")],
            "sliding_append": [sliding_item("go", &"s".repeat(20), 9, "2026-01-01T00:00:02.000000Z")],
        });
        let applied = manager.apply_patch(&patch, &ledger).unwrap();
        assert_eq!(applied.ws.pinned_context.len(), 1);
        assert!(applied.ws.sliding_context.is_empty());
        assert_eq!(applied.evicted, vec!["go"]);
    }

    #[test]
    fn budget_unsatisfiable_by_eviction_overflows() {
        let (_dir, manager, ledger) = setup(4);
        boot(&manager, &ledger, &"o".repeat(40));

        let patch = json!({ "_schema_version": "2.1", "expected_seq": 0, "status": "BUSY" });
        assert!(matches!(
            manager.apply_patch(&patch, &ledger),
            Err(WsError::BudgetExceeded { .. })
        ));
        assert_eq!(manager.load().unwrap().update_seq, 0);
    }

    #[test]
    fn eviction_is_deterministic_across_reruns() {
        let ts = "2026-01-01T00:00:01.000000Z";
        let patch = json!({
            "_schema_version": "2.1",
            "expected_seq": 0,
            "sliding_append": [
                sliding_item("b", &"x".repeat(40), 1, ts),
                sliding_item("a", &"x".repeat(40), 1, ts),
                sliding_item("c", &"x".repeat(40), 1, ts),
            ],
        });

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let (_dir, manager, ledger) = setup(14);
            boot(&manager, &ledger, "A");
            let applied = manager.apply_patch(&patch, &ledger).unwrap();
            outcomes.push(applied.evicted.clone());
        }
        assert_eq!(outcomes[0], outcomes[1]);
        // Same priority, same timestamp: ids break the tie.
        assert_eq!(outcomes[0], vec!["a", "b"]);
    }

    #[test]
    fn reconcile_warns_but_trusts_ws_file() {
        let (_dir, manager, ledger) = setup(8192);
        boot(&manager, &ledger, "obj");
        // Forge a ledger entry claiming a later seq than the file holds.
        ledger
            .append(
                EventType::WsUpdateApplied,
                json!({ "before_seq": 0, "after_seq": 5, "directives_summary": {}, "evicted": [] }),
            )
            .unwrap();
        let ws = manager.load_and_reconcile(&ledger).unwrap();
        assert_eq!(ws.update_seq, 0);
    }
}
