//! Long-term memory: two-phase propose/commit staging.
//!
//! Mutations arrive as change requests and land as *proposed* state in a
//! batch; only a milestone-gated commit flips them to *committed*. Status
//! transitions form a DAG (`proposed → committed → retracted`) with no
//! reverse edges.
//!
//! [`MemoryBackend`] is the substitution boundary for a vector database:
//! any backend must keep the same staging, filtering, and deterministic
//! ordering guarantees so tests port across implementations. The
//! [`InMemoryStore`] baseline ranks by case-insensitive substring match.
//!
//! The milestone-token check itself lives with the runtime, which owns
//! token lifecycles; backends enforce batch existence and the status DAG.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use keel_core::time::now_iso;
use keel_core::types::{
    Mcr, McrOp, MemoryHit, MemoryItem, MemoryScope, MemoryStatus, MemoryType, ScopeFilters,
};
use keel_core::{validate, BatchId, MemoryId, RunId, TaskId, ThreadId, ValidationError, SCHEMA_VERSION};

/// Errors from memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// An MCR failed validation or its scope was disallowed.
    #[error("memory schema: {0}")]
    Schema(#[from] ValidationError),

    /// The batch id is not staged.
    #[error("unknown batch {batch_id}")]
    UnknownBatch {
        /// The unrecognized batch.
        batch_id: BatchId,
    },

    /// The memory id is not in the store.
    #[error("memory item {id} not found")]
    NotFound {
        /// The unrecognized id.
        id: MemoryId,
    },

    /// The requested status change would reverse the DAG.
    #[error("memory item {id} is {from:?}; cannot {action}")]
    InvalidTransition {
        /// The target item.
        id: MemoryId,
        /// Its current status.
        from: MemoryStatus,
        /// The refused action.
        action: &'static str,
    },
}

/// Result alias for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Identity of the run performing a memory operation; scopes resolve
/// against these identifiers.
#[derive(Clone, Debug)]
pub struct Viewer {
    /// The operating run.
    pub run_id: RunId,
    /// Its task.
    pub task_id: TaskId,
    /// Its thread.
    pub thread_id: ThreadId,
}

/// Receipt for a staged batch.
#[derive(Clone, Debug)]
pub struct ProposeReceipt {
    /// Server-minted batch id; the unit of commit.
    pub batch_id: BatchId,
    /// Ids touched by the batch: minted ids for adds, targets for
    /// updates and retractions.
    pub proposed_ids: Vec<MemoryId>,
}

/// Search parameters. Omitted filters match everything; an omitted status
/// defaults to committed.
#[derive(Clone, Debug, Default)]
pub struct SearchQuery {
    /// Substring to match against content, case-insensitively.
    pub text: Option<String>,
    /// Restrict to one scope.
    pub scope: Option<MemoryScope>,
    /// Restrict to one kind.
    pub kind: Option<MemoryType>,
    /// Restrict to one status (default: committed).
    pub status: Option<MemoryStatus>,
    /// Maximum hits returned.
    pub top_k: usize,
}

/// The pluggable memory contract.
///
/// Gating happens above this trait; implementations must keep batch
/// semantics, the status DAG, scope visibility, and deterministic search
/// ordering.
pub trait MemoryBackend: Send {
    /// Validate and stage a batch of change requests.
    fn propose(
        &mut self,
        viewer: &Viewer,
        mcrs: &[Mcr],
        scope_filters: &ScopeFilters,
    ) -> Result<ProposeReceipt>;

    /// Atomically apply a staged batch, consuming it.
    fn commit(&mut self, batch_id: &BatchId) -> Result<Vec<MemoryId>>;

    /// Search visible items with deterministic ordering.
    fn search(&self, viewer: &Viewer, query: &SearchQuery) -> Vec<MemoryHit>;

    /// Directly retract a committed item.
    fn retract(&mut self, id: &MemoryId, reason: &str) -> Result<()>;

    /// Fetch one item by id.
    fn get(&self, id: &MemoryId) -> Option<MemoryItem>;
}

enum StagedChange {
    /// The item already sits in the store as proposed; commit flips it.
    Add(MemoryId),
    /// Field overrides for a committed target.
    Update { target: MemoryId, overrides: Mcr },
    /// Tombstone a committed target.
    Retract { target: MemoryId },
}

/// The baseline in-process store.
#[derive(Default)]
pub struct InMemoryStore {
    items: HashMap<MemoryId, MemoryItem>,
    batches: HashMap<BatchId, Vec<StagedChange>>,
    /// Pre-update snapshots, newest last, keyed by item id.
    history: HashMap<MemoryId, Vec<MemoryItem>>,
}

impl InMemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Superseded versions of an item, oldest first.
    #[must_use]
    pub fn version_history(&self, id: &MemoryId) -> &[MemoryItem] {
        self.history.get(id).map_or(&[], Vec::as_slice)
    }

    fn scope_ref_for(viewer: &Viewer, scope: MemoryScope) -> Option<String> {
        match scope {
            MemoryScope::Global => None,
            MemoryScope::Run => Some(viewer.run_id.as_str().to_string()),
            MemoryScope::Task => Some(viewer.task_id.as_str().to_string()),
            MemoryScope::Thread => Some(viewer.thread_id.as_str().to_string()),
        }
    }

    fn visible_to(item: &MemoryItem, viewer: &Viewer) -> bool {
        let wanted = match item.scope {
            MemoryScope::Global => return true,
            MemoryScope::Run => viewer.run_id.as_str(),
            MemoryScope::Task => viewer.task_id.as_str(),
            MemoryScope::Thread => viewer.thread_id.as_str(),
        };
        item.scope_ref.as_deref() == Some(wanted)
    }

    fn committed_target(&self, id: &MemoryId, action: &'static str) -> Result<&MemoryItem> {
        let item = self.items.get(id).ok_or_else(|| MemoryError::NotFound { id: id.clone() })?;
        if item.status != MemoryStatus::Committed {
            return Err(MemoryError::InvalidTransition {
                id: id.clone(),
                from: item.status,
                action,
            });
        }
        Ok(item)
    }
}

impl MemoryBackend for InMemoryStore {
    fn propose(
        &mut self,
        viewer: &Viewer,
        mcrs: &[Mcr],
        scope_filters: &ScopeFilters,
    ) -> Result<ProposeReceipt> {
        // Validate the whole batch before staging any of it.
        for (idx, raw) in mcrs.iter().enumerate() {
            let value = serde_json::to_value(raw)
                .map_err(|e| ValidationError::at(format!("/mcrs/{idx}"), e.to_string()))?;
            let mcr = validate::mcr(&value)
                .map_err(|e| ValidationError::at(format!("/mcrs/{idx}{}", e.pointer), e.message))?;
            if let Some(scope) = mcr.scope {
                if !scope_filters.allows(scope) {
                    return Err(ValidationError::at(
                        format!("/mcrs/{idx}/scope"),
                        format!("scope {scope:?} disallowed by scope_filters").to_lowercase(),
                    )
                    .into());
                }
            }
            match mcr.op {
                McrOp::Add => {}
                McrOp::Update | McrOp::Retract => {
                    let target = mcr.target_id.as_ref().expect("validated above");
                    let action = if mcr.op == McrOp::Update { "stage update" } else { "stage retract" };
                    self.committed_target(target, action)?;
                }
            }
        }

        let batch_id = BatchId::mint();
        let mut staged = Vec::with_capacity(mcrs.len());
        let mut proposed_ids = Vec::with_capacity(mcrs.len());

        for mcr in mcrs {
            match mcr.op {
                McrOp::Add => {
                    let scope = mcr.scope.expect("validated above");
                    let item = MemoryItem {
                        schema_version: SCHEMA_VERSION.to_string(),
                        id: MemoryId::mint(),
                        kind: mcr.kind.expect("validated above"),
                        scope,
                        scope_ref: Self::scope_ref_for(viewer, scope),
                        content: mcr.content.clone().expect("validated above"),
                        confidence: mcr.confidence.expect("validated above"),
                        rationale: mcr.rationale.clone().expect("validated above"),
                        source_refs: mcr.source_refs.clone().unwrap_or_default(),
                        status: MemoryStatus::Proposed,
                        batch_id: batch_id.clone(),
                        created_at: now_iso(),
                        committed_at: None,
                    };
                    proposed_ids.push(item.id.clone());
                    staged.push(StagedChange::Add(item.id.clone()));
                    self.items.insert(item.id.clone(), item);
                }
                McrOp::Update => {
                    let target = mcr.target_id.clone().expect("validated above");
                    proposed_ids.push(target.clone());
                    staged.push(StagedChange::Update { target, overrides: mcr.clone() });
                }
                McrOp::Retract => {
                    let target = mcr.target_id.clone().expect("validated above");
                    proposed_ids.push(target.clone());
                    staged.push(StagedChange::Retract { target });
                }
            }
        }

        debug!(batch_id = %batch_id, count = staged.len(), "memory batch staged");
        self.batches.insert(batch_id.clone(), staged);
        Ok(ProposeReceipt { batch_id, proposed_ids })
    }

    fn commit(&mut self, batch_id: &BatchId) -> Result<Vec<MemoryId>> {
        // Re-validate every transition before mutating anything, so a batch
        // invalidated since propose (e.g. a target retracted in between)
        // fails whole rather than half-applied.
        {
            let staged = self
                .batches
                .get(batch_id)
                .ok_or_else(|| MemoryError::UnknownBatch { batch_id: batch_id.clone() })?;
            for change in staged {
                match change {
                    StagedChange::Add(id) => {
                        let item = self
                            .items
                            .get(id)
                            .ok_or_else(|| MemoryError::NotFound { id: id.clone() })?;
                        if item.status != MemoryStatus::Proposed {
                            return Err(MemoryError::InvalidTransition {
                                id: id.clone(),
                                from: item.status,
                                action: "commit add",
                            });
                        }
                    }
                    StagedChange::Update { target, .. } => {
                        self.committed_target(target, "commit update")?;
                    }
                    StagedChange::Retract { target } => {
                        self.committed_target(target, "commit retract")?;
                    }
                }
            }
        }

        let staged = self.batches.remove(batch_id).expect("presence checked above");
        let committed_at = now_iso();
        let mut committed_ids = Vec::with_capacity(staged.len());

        for change in staged {
            match change {
                StagedChange::Add(id) => {
                    let item = self
                        .items
                        .get_mut(&id)
                        .ok_or_else(|| MemoryError::NotFound { id: id.clone() })?;
                    item.status = MemoryStatus::Committed;
                    item.committed_at = Some(committed_at.clone());
                    committed_ids.push(id);
                }
                StagedChange::Update { target, overrides } => {
                    let prior = self.committed_target(&target, "commit update")?.clone();
                    let item = self.items.get_mut(&target).expect("checked above");
                    if let Some(content) = overrides.content {
                        item.content = content;
                    }
                    if let Some(confidence) = overrides.confidence {
                        item.confidence = confidence;
                    }
                    if let Some(rationale) = overrides.rationale {
                        item.rationale = rationale;
                    }
                    if let Some(source_refs) = overrides.source_refs {
                        item.source_refs = source_refs;
                    }
                    item.committed_at = Some(committed_at.clone());
                    self.history.entry(target.clone()).or_default().push(prior);
                    committed_ids.push(target);
                }
                StagedChange::Retract { target } => {
                    self.committed_target(&target, "commit retract")?;
                    let item = self.items.get_mut(&target).expect("checked above");
                    item.status = MemoryStatus::Retracted;
                    committed_ids.push(target);
                }
            }
        }

        debug!(batch_id = %batch_id, count = committed_ids.len(), "memory batch committed");
        Ok(committed_ids)
    }

    fn search(&self, viewer: &Viewer, query: &SearchQuery) -> Vec<MemoryHit> {
        let wanted_status = query.status.unwrap_or(MemoryStatus::Committed);
        let needle = query
            .text
            .as_deref()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty());

        let mut hits: Vec<MemoryHit> = self
            .items
            .values()
            .filter(|item| item.status == wanted_status)
            .filter(|item| query.scope.map_or(true, |s| item.scope == s))
            .filter(|item| query.kind.map_or(true, |k| item.kind == k))
            .filter(|item| Self::visible_to(item, viewer))
            .filter_map(|item| match &needle {
                None => Some(MemoryHit { item: item.clone(), score: 1.0 }),
                Some(needle) if item.content.to_lowercase().contains(needle.as_str()) => {
                    Some(MemoryHit { item: item.clone(), score: 1.0 })
                }
                Some(_) => None,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.item
                        .confidence
                        .partial_cmp(&a.item.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.item.created_at.cmp(&a.item.created_at))
                .then_with(|| a.item.id.cmp(&b.item.id))
        });
        hits.truncate(query.top_k);
        hits
    }

    fn retract(&mut self, id: &MemoryId, reason: &str) -> Result<()> {
        self.committed_target(id, "retract")?;
        let item = self.items.get_mut(id).expect("checked above");
        item.status = MemoryStatus::Retracted;
        debug!(id = %id, reason, "memory item retracted");
        Ok(())
    }

    fn get(&self, id: &MemoryId) -> Option<MemoryItem> {
        self.items.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn viewer() -> Viewer {
        Viewer {
            run_id: RunId::from("run_1"),
            task_id: TaskId::from("task_1"),
            thread_id: ThreadId::from("thread_1"),
        }
    }

    fn add_mcr(content: &str, scope: &str, confidence: f64) -> Mcr {
        serde_json::from_value(json!({
            "op": "add",
            "type": "fact",
            "scope": scope,
            "content": content,
            "confidence": confidence,
            "rationale": "observed",
            "source_refs": [],
        }))
        .unwrap()
    }

    fn commit_one(store: &mut InMemoryStore, content: &str) -> MemoryId {
        let receipt = store
            .propose(&viewer(), &[add_mcr(content, "global", 0.9)], &ScopeFilters::default())
            .unwrap();
        store.commit(&receipt.batch_id).unwrap().remove(0)
    }

    #[test]
    fn proposed_items_are_invisible_to_default_search() {
        let mut store = InMemoryStore::new();
        store
            .propose(&viewer(), &[add_mcr("hidden", "global", 0.9)], &ScopeFilters::default())
            .unwrap();
        let hits = store.search(&viewer(), &SearchQuery { top_k: 10, ..Default::default() });
        assert!(hits.is_empty());
    }

    #[test]
    fn commit_flips_to_committed_with_timestamp() {
        let mut store = InMemoryStore::new();
        let id = commit_one(&mut store, "the build uses make");
        let item = store.get(&id).unwrap();
        assert_eq!(item.status, MemoryStatus::Committed);
        assert!(item.committed_at.is_some());
    }

    #[test]
    fn second_commit_of_same_batch_is_unknown() {
        let mut store = InMemoryStore::new();
        let receipt = store
            .propose(&viewer(), &[add_mcr("x", "global", 0.9)], &ScopeFilters::default())
            .unwrap();
        store.commit(&receipt.batch_id).unwrap();
        assert!(matches!(
            store.commit(&receipt.batch_id),
            Err(MemoryError::UnknownBatch { .. })
        ));
    }

    #[test]
    fn scope_filter_blocks_disallowed_scope_before_staging() {
        let mut store = InMemoryStore::new();
        let filters = ScopeFilters { allowed_scopes: vec![MemoryScope::Run] };
        let err = store
            .propose(&viewer(), &[add_mcr("x", "global", 0.9)], &filters)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Schema(_)));
    }

    #[test]
    fn run_scoped_item_is_invisible_to_other_runs() {
        let mut store = InMemoryStore::new();
        let receipt = store
            .propose(&viewer(), &[add_mcr("private", "run", 0.9)], &ScopeFilters::default())
            .unwrap();
        store.commit(&receipt.batch_id).unwrap();

        let same_run = store.search(&viewer(), &SearchQuery { top_k: 10, ..Default::default() });
        assert_eq!(same_run.len(), 1);

        let other = Viewer {
            run_id: RunId::from("run_2"),
            task_id: TaskId::from("task_1"),
            thread_id: ThreadId::from("thread_1"),
        };
        let other_run = store.search(&other, &SearchQuery { top_k: 10, ..Default::default() });
        assert!(other_run.is_empty());
    }

    #[test]
    fn search_matches_substring_case_insensitively() {
        let mut store = InMemoryStore::new();
        commit_one(&mut store, "Deploys run through GitHub Actions");
        commit_one(&mut store, "unrelated");

        let hits = store.search(
            &viewer(),
            &SearchQuery { text: Some("github".to_string()), top_k: 10, ..Default::default() },
        );
        assert_eq!(hits.len(), 1);
        assert!(hits[0].item.content.contains("GitHub"));
    }

    #[test]
    fn ties_break_by_confidence_then_recency_then_id() {
        let mut store = InMemoryStore::new();
        let receipt = store
            .propose(
                &viewer(),
                &[add_mcr("alpha note", "global", 0.5), add_mcr("beta note", "global", 0.9)],
                &ScopeFilters::default(),
            )
            .unwrap();
        store.commit(&receipt.batch_id).unwrap();

        let hits = store.search(
            &viewer(),
            &SearchQuery { text: Some("note".to_string()), top_k: 10, ..Default::default() },
        );
        assert_eq!(hits.len(), 2);
        assert!(hits[0].item.confidence > hits[1].item.confidence);
    }

    #[test]
    fn update_overrides_fields_and_keeps_prior_version() {
        let mut store = InMemoryStore::new();
        let id = commit_one(&mut store, "old content");

        let update: Mcr = serde_json::from_value(json!({
            "op": "update",
            "target_id": id.as_str(),
            "content": "new content",
            "confidence": 0.95,
        }))
        .unwrap();
        let receipt = store.propose(&viewer(), &[update], &ScopeFilters::default()).unwrap();
        let committed = store.commit(&receipt.batch_id).unwrap();
        assert_eq!(committed, vec![id.clone()]);

        let item = store.get(&id).unwrap();
        assert_eq!(item.content, "new content");
        assert_eq!(item.confidence, 0.95);

        let history = store.version_history(&id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "old content");
    }

    #[test]
    fn retract_tombstones_and_cannot_reverse() {
        let mut store = InMemoryStore::new();
        let id = commit_one(&mut store, "to be removed");

        store.retract(&id, "superseded").unwrap();
        assert_eq!(store.get(&id).unwrap().status, MemoryStatus::Retracted);

        // Retracting again reverses nothing.
        assert!(matches!(
            store.retract(&id, "again"),
            Err(MemoryError::InvalidTransition { .. })
        ));

        // Retracted items drop out of committed search.
        let hits = store.search(&viewer(), &SearchQuery { top_k: 10, ..Default::default() });
        assert!(hits.is_empty());
    }

    #[test]
    fn update_of_proposed_item_is_refused() {
        let mut store = InMemoryStore::new();
        let receipt = store
            .propose(&viewer(), &[add_mcr("draft", "global", 0.9)], &ScopeFilters::default())
            .unwrap();
        let proposed_id = receipt.proposed_ids[0].clone();

        let update: Mcr = serde_json::from_value(json!({
            "op": "update",
            "target_id": proposed_id.as_str(),
            "content": "nope",
        }))
        .unwrap();
        assert!(matches!(
            store.propose(&viewer(), &[update], &ScopeFilters::default()),
            Err(MemoryError::InvalidTransition { .. })
        ));
    }
}
