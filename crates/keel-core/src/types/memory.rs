//! Long-term memory items and the change requests that stage them.

use serde::{Deserialize, Serialize};

use crate::ids::{BatchId, MemoryId};

/// What kind of knowledge a memory item holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// A stable fact about the world or the codebase.
    Fact,
    /// A user or project preference.
    Preference,
    /// A learned procedure.
    Skill,
    /// Anything else worth keeping.
    Other,
}

/// Visibility domain of a memory item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    /// Visible to every run in the namespace.
    Global,
    /// Visible only to the run named by `scope_ref`.
    Run,
    /// Visible only to the task named by `scope_ref`.
    Task,
    /// Visible only to the thread named by `scope_ref`.
    Thread,
}

/// Lifecycle status. Transitions form a DAG:
/// `proposed → committed → retracted`, no reverse edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    /// Staged by `propose`; invisible to search.
    Proposed,
    /// Flipped by a milestone-gated commit.
    Committed,
    /// Tombstoned.
    Retracted,
}

/// One long-term memory item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryItem {
    /// Always `"2.1"`.
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    /// Unique id.
    pub id: MemoryId,
    /// Knowledge kind.
    #[serde(rename = "type")]
    pub kind: MemoryType,
    /// Visibility domain.
    pub scope: MemoryScope,
    /// Exact-match identifier the scope binds to; `None` for global scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_ref: Option<String>,
    /// The remembered content.
    pub content: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Why this is believed.
    pub rationale: String,
    /// Opaque references to the evidence.
    pub source_refs: Vec<String>,
    /// Lifecycle status.
    pub status: MemoryStatus,
    /// The propose batch that staged this item.
    pub batch_id: BatchId,
    /// ISO-8601 UTC staging time.
    pub created_at: String,
    /// ISO-8601 UTC commit time, once committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<String>,
}

/// Operation carried by a memory change request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McrOp {
    /// Stage a new item.
    Add,
    /// Stage field overrides for an existing committed item.
    Update,
    /// Stage a retraction of an existing committed item.
    Retract,
}

/// A memory change request: the input shape of `propose`.
///
/// `add` requires the item fields; `update` and `retract` require
/// `target_id`. Server-minted fields (`id`, `status`, `batch_id`,
/// timestamps) are absent by construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mcr {
    /// What to do.
    pub op: McrOp,
    /// Target of `update`/`retract`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<MemoryId>,
    /// Knowledge kind (required for `add`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryType>,
    /// Visibility domain (required for `add`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<MemoryScope>,
    /// Content (required for `add`; override for `update`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Confidence in [0, 1] (required for `add`; override for `update`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Rationale (required for `add`; override for `update`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Evidence references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_refs: Option<Vec<String>>,
}

/// Advisory pre-check applied at propose time: MCRs whose scope the filter
/// disallows fail validation before staging.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeFilters {
    /// Scopes the caller allows; empty means all scopes are allowed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_scopes: Vec<MemoryScope>,
}

impl ScopeFilters {
    /// Whether `scope` passes this filter.
    #[must_use]
    pub fn allows(&self, scope: MemoryScope) -> bool {
        self.allowed_scopes.is_empty() || self.allowed_scopes.contains(&scope)
    }
}

/// One search result: the committed item plus its match score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    /// The matched item.
    pub item: MemoryItem,
    /// Deterministic relevance score.
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_use_lowercase_wire_values() {
        assert_eq!(serde_json::to_string(&MemoryType::Fact).unwrap(), "\"fact\"");
        assert_eq!(
            serde_json::to_string(&MemoryScope::Global).unwrap(),
            "\"global\""
        );
        assert_eq!(
            serde_json::to_string(&MemoryStatus::Proposed).unwrap(),
            "\"proposed\""
        );
        assert_eq!(serde_json::to_string(&McrOp::Retract).unwrap(), "\"retract\"");
    }

    #[test]
    fn mcr_add_parses_without_target() {
        let raw = serde_json::json!({
            "op": "add",
            "type": "fact",
            "scope": "global",
            "content": "the deploy script lives in infra/",
            "confidence": 0.9,
            "rationale": "observed",
            "source_refs": ["evt_3"],
        });
        let mcr: Mcr = serde_json::from_value(raw).unwrap();
        assert_eq!(mcr.op, McrOp::Add);
        assert!(mcr.target_id.is_none());
    }

    #[test]
    fn mcr_rejects_server_minted_fields() {
        let raw = serde_json::json!({
            "op": "add",
            "type": "fact",
            "scope": "global",
            "content": "x",
            "confidence": 0.5,
            "rationale": "r",
            "status": "committed",
        });
        assert!(serde_json::from_value::<Mcr>(raw).is_err());
    }

    #[test]
    fn scope_filter_empty_allows_everything() {
        let filters = ScopeFilters::default();
        assert!(filters.allows(MemoryScope::Global));
        assert!(filters.allows(MemoryScope::Thread));
    }

    #[test]
    fn scope_filter_restricts_to_listed_scopes() {
        let filters = ScopeFilters {
            allowed_scopes: vec![MemoryScope::Run],
        };
        assert!(filters.allows(MemoryScope::Run));
        assert!(!filters.allows(MemoryScope::Global));
    }
}
