//! The ten-operation service surface.
//!
//! [`Service`] is the single owned value binding the working-set manager,
//! the run ledger, the memory store, the episode sealer, and resume packs.
//! It is protocol-agnostic: an HTTP layer would bind each method to an
//! endpoint and serialize [`ServiceError::to_body`] for failures.
//!
//! Locking: each operation takes its run's mutex first and the memory
//! mutex second, never the reverse. No operation retries internally;
//! recovery is caller-driven through the optimistic-concurrency sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use keel_core::brief::render_context_brief;
use keel_core::types::{
    Episode, EventType, Mcr, MemoryHit, MemoryScope, MemoryStatus, MemoryType, PackManifest,
    ScopeFilters, WorkingSet,
};
use keel_core::{
    validate, BatchId, EpisodeId, MemoryId, MilestoneToken, PackId, RunId, TaskId, ThreadId,
    ValidationError, SCHEMA_VERSION,
};
use keel_store::episode::{latest_episode, summarize_events, write_episode};
use keel_store::memory::{InMemoryStore, MemoryBackend, SearchQuery};
use keel_store::pack;

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::run::{PendingToken, RunHandle};

// ─────────────────────────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// `boot` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BootRequest {
    /// What the run should accomplish.
    pub objective: String,
    /// Ordered acceptance criteria.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Ordered constraints.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Task id; minted when absent.
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Thread id; minted when absent.
    #[serde(default)]
    pub thread_id: Option<ThreadId>,
}

/// `boot` response.
#[derive(Clone, Debug, Serialize)]
pub struct BootResponse {
    /// The minted run id.
    pub run_id: RunId,
    /// The initial working set.
    pub ws: WorkingSet,
}

/// `apply_patch` response.
#[derive(Clone, Debug, Serialize)]
pub struct PatchResponse {
    /// The new working set.
    pub ws: WorkingSet,
    /// Rendered context brief for the next model call.
    pub context_brief: String,
}

/// `propose_memory` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProposeMemoryRequest {
    /// The proposing run.
    pub run_id: RunId,
    /// Raw change requests; validated before staging.
    pub mcrs: Vec<Value>,
    /// Advisory scope pre-check.
    #[serde(default)]
    pub scope_filters: Option<ScopeFilters>,
}

/// `propose_memory` response.
#[derive(Clone, Debug, Serialize)]
pub struct ProposeMemoryResponse {
    /// The staged batch, the unit of commit.
    pub batch_id: BatchId,
    /// Ids touched by the batch.
    pub proposed_ids: Vec<MemoryId>,
}

/// `commit_memory` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitMemoryRequest {
    /// The committing run.
    pub run_id: RunId,
    /// The staged batch.
    pub batch_id: BatchId,
    /// The one-shot credential from a prior `milestone`.
    #[serde(default)]
    pub milestone_token: Option<MilestoneToken>,
    /// Test-mode bypass; honored only when the service runs with
    /// `test_mode` enabled.
    #[serde(default)]
    pub allow_outside_milestone: bool,
}

/// `commit_memory` response.
#[derive(Clone, Debug, Serialize)]
pub struct CommitMemoryResponse {
    /// Items flipped to committed (or updated / retracted).
    pub committed_ids: Vec<MemoryId>,
}

fn default_top_k() -> usize {
    8
}

/// `search_memory` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchMemoryRequest {
    /// The searching run; scope visibility resolves against it.
    pub run_id: RunId,
    /// Substring query; empty matches everything.
    #[serde(default)]
    pub q: Option<String>,
    /// Maximum results.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Restrict to one scope.
    #[serde(default)]
    pub scope: Option<MemoryScope>,
    /// Restrict to one status (default committed).
    #[serde(default)]
    pub status: Option<MemoryStatus>,
    /// Restrict to one kind.
    #[serde(rename = "type", default)]
    pub kind: Option<MemoryType>,
}

/// `search_memory` response.
#[derive(Clone, Debug, Serialize)]
pub struct SearchMemoryResponse {
    /// Hits in deterministic order.
    pub results: Vec<MemoryHit>,
}

/// `milestone` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MilestoneRequest {
    /// The run to seal.
    pub run_id: RunId,
    /// Why the caller is sealing.
    pub reason: String,
    /// Batch to commit under the freshly minted token.
    #[serde(default)]
    pub memory_batch_id: Option<BatchId>,
    /// Where a resumed run should pick up.
    #[serde(default)]
    pub next_entry_point: Option<String>,
}

/// `milestone` response.
#[derive(Clone, Debug, Serialize)]
pub struct MilestoneResponse {
    /// The sealed episode.
    pub episode_id: EpisodeId,
    /// Path of the episode document.
    pub path: PathBuf,
    /// Memory committed during the seal.
    pub committed_ids: Vec<MemoryId>,
    /// The pending token, returned only when the sealer did not commit.
    pub milestone_token: Option<MilestoneToken>,
}

fn default_true() -> bool {
    true
}

/// `resume_snapshot` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeSnapshotRequest {
    /// The run to snapshot.
    pub run_id: RunId,
    /// Materialize a `.zip` (default) or a directory.
    #[serde(default = "default_true")]
    pub zip_pack: bool,
    /// Free-form opaque pointers carried in the manifest.
    #[serde(default)]
    pub pointers: Option<Value>,
}

/// `resume_snapshot` response.
#[derive(Clone, Debug, Serialize)]
pub struct ResumeSnapshotResponse {
    /// The minted pack id.
    pub pack_id: PackId,
    /// Where the pack landed.
    pub path: PathBuf,
    /// The manifest as written.
    pub manifest: PackManifest,
}

/// `resume_load` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeLoadRequest {
    /// Pack directory or `.zip`.
    pub pack_path: PathBuf,
    /// New run id; minted when absent.
    #[serde(default)]
    pub new_run_id: Option<RunId>,
}

/// `resume_load` response.
#[derive(Clone, Debug, Serialize)]
pub struct ResumeLoadResponse {
    /// The reconstituted run.
    pub run_id: RunId,
    /// Its restored working set.
    pub ws: WorkingSet,
}

/// `health` response.
#[derive(Clone, Debug, Serialize)]
pub struct Health {
    /// Always `"ok"` when the service answers.
    pub status: String,
    /// Crate version.
    pub version: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// The transactional state manager for a namespace of runs.
pub struct Service {
    config: Config,
    runs: Mutex<HashMap<RunId, Arc<Mutex<RunHandle>>>>,
    memory: Mutex<Box<dyn MemoryBackend>>,
}

impl Service {
    /// Create a service with the baseline in-memory long-term memory store.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_backend(config, Box::new(InMemoryStore::new()))
    }

    /// Create a service with a custom memory backend (e.g. a vector store).
    #[must_use]
    pub fn with_backend(config: Config, backend: Box<dyn MemoryBackend>) -> Self {
        Self { config, runs: Mutex::new(HashMap::new()), memory: Mutex::new(backend) }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drop every run handle, releasing append handles and file locks.
    pub fn shutdown(&self) {
        let count = {
            let mut runs = self.runs.lock();
            let count = runs.len();
            runs.clear();
            count
        };
        info!(runs = count, "service shut down");
    }

    fn handle(&self, run_id: &RunId) -> Result<Arc<Mutex<RunHandle>>> {
        let mut runs = self.runs.lock();
        if let Some(handle) = runs.get(run_id) {
            return Ok(handle.clone());
        }
        // Reattach a run that exists on disk but is not yet open.
        let ws_path = self.config.run_dir(run_id).join(pack::WS_REL_PATH);
        if !ws_path.exists() {
            return Err(ServiceError::NotFound { message: format!("run {run_id} not found") });
        }
        let handle = Arc::new(Mutex::new(RunHandle::open(&self.config, run_id.clone())?));
        runs.insert(run_id.clone(), handle.clone());
        Ok(handle)
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Create a run: mint ids, lay out its directory, persist the initial
    /// working set, record `BOOT`.
    pub fn boot(&self, req: &BootRequest) -> Result<BootResponse> {
        let run_id = RunId::mint();
        let handle = Arc::new(Mutex::new(RunHandle::open(&self.config, run_id.clone())?));

        let ws = {
            let run = handle.lock();
            let initial = WorkingSet::initial(
                run_id.clone(),
                req.task_id.clone().unwrap_or_else(TaskId::mint),
                req.thread_id.clone().unwrap_or_else(ThreadId::mint),
                req.objective.clone(),
                req.acceptance_criteria.clone(),
                req.constraints.clone(),
            );
            run.ws().create_initial(initial, run.ledger())?
        };

        self.runs.lock().insert(run_id.clone(), handle);
        info!(run_id = %run_id, "run booted");
        Ok(BootResponse { run_id, ws })
    }

    /// Fetch a run's current working set.
    pub fn get_ws(&self, run_id: &RunId) -> Result<WorkingSet> {
        let handle = self.handle(run_id)?;
        let run = handle.lock();
        Ok(run.ws().load()?)
    }

    /// Apply a working-set patch and render the context brief.
    pub fn apply_patch(&self, run_id: &RunId, patch: &Value) -> Result<PatchResponse> {
        let handle = self.handle(run_id)?;
        let run = handle.lock();
        let applied = run.ws().apply_patch(patch, run.ledger())?;

        let viewer = RunHandle::viewer(&applied.ws);
        let hits = self.memory.lock().search(
            &viewer,
            &SearchQuery {
                text: Some(applied.ws.objective.clone()),
                top_k: default_top_k(),
                ..Default::default()
            },
        );
        let context_brief = render_context_brief(&applied.ws, None, Some(&hits));
        Ok(PatchResponse { ws: applied.ws, context_brief })
    }

    /// Validate and stage memory change requests.
    pub fn propose_memory(&self, req: &ProposeMemoryRequest) -> Result<ProposeMemoryResponse> {
        let handle = self.handle(&req.run_id)?;
        let run = handle.lock();
        let ws = run.ws().load()?;

        let mut mcrs: Vec<Mcr> = Vec::with_capacity(req.mcrs.len());
        for (idx, raw) in req.mcrs.iter().enumerate() {
            let mcr = validate::mcr(raw).map_err(|e| {
                ValidationError::at(format!("/mcrs/{idx}{}", e.pointer), e.message)
            })?;
            mcrs.push(mcr);
        }

        let filters = req.scope_filters.clone().unwrap_or_default();
        let receipt =
            self.memory.lock().propose(&RunHandle::viewer(&ws), &mcrs, &filters)?;

        run.ledger().append(
            EventType::MemoryProposed,
            json!({ "batch_id": receipt.batch_id, "count": mcrs.len() }),
        )?;

        Ok(ProposeMemoryResponse {
            batch_id: receipt.batch_id,
            proposed_ids: receipt.proposed_ids,
        })
    }

    /// Commit a staged batch behind the milestone gate.
    ///
    /// The double-key rule: the batch id names *what* to commit, the
    /// pending milestone token authorizes *that it may happen now*. The
    /// token is consumed on success. `allow_outside_milestone` bypasses
    /// the token only when the service itself runs in test mode.
    pub fn commit_memory(&self, req: &CommitMemoryRequest) -> Result<CommitMemoryResponse> {
        let handle = self.handle(&req.run_id)?;
        let mut run = handle.lock();

        let bypass = self.config.test_mode && req.allow_outside_milestone;
        if !bypass {
            let accepted = match (&req.milestone_token, &run.pending_token) {
                (Some(presented), Some(pending)) => pending.accepts(presented),
                _ => false,
            };
            if !accepted {
                return Err(ServiceError::Gate {
                    message: "memory commit requires the milestone token from a prior seal"
                        .to_string(),
                });
            }
        }

        let committed_ids = self.memory.lock().commit(&req.batch_id)?;
        if !bypass {
            run.pending_token = None;
        }

        run.ledger().append(
            EventType::MemoryCommitted,
            json!({ "batch_id": req.batch_id, "ids": committed_ids }),
        )?;

        Ok(CommitMemoryResponse { committed_ids })
    }

    /// Search long-term memory visible to a run.
    pub fn search_memory(&self, req: &SearchMemoryRequest) -> Result<SearchMemoryResponse> {
        let handle = self.handle(&req.run_id)?;
        let run = handle.lock();
        let ws = run.ws().load()?;

        let results = self.memory.lock().search(
            &RunHandle::viewer(&ws),
            &SearchQuery {
                text: req.q.clone(),
                scope: req.scope,
                kind: req.kind,
                status: req.status,
                top_k: req.top_k,
            },
        );
        Ok(SearchMemoryResponse { results })
    }

    /// Seal an episode: checkpoint the working set, commit the optional
    /// batch under a freshly minted token, write the immutable episode
    /// document, and record `EPISODE_SEALED`.
    ///
    /// Consecutive episodes tile the ledger: the span starts right after
    /// the previous episode's span (or at sequence 0) and ends at the
    /// `EPISODE_SEALED` event itself.
    pub fn milestone(&self, req: &MilestoneRequest) -> Result<MilestoneResponse> {
        let handle = self.handle(&req.run_id)?;
        let mut run = handle.lock();
        let episodes_dir = run.run_dir().join("episodes");

        let ws_before = run.ws().load()?;
        let ledger_from = match latest_episode(&episodes_dir)? {
            Some((_, prior)) => prior.ledger_span.to_seq + 1,
            None => 0,
        };

        // Any previously pending token is invalidated by the new seal.
        let pending = PendingToken::mint();
        let token = pending.token().clone();
        run.pending_token = Some(pending);

        let mut committed_ids = Vec::new();
        if let Some(batch_id) = &req.memory_batch_id {
            match self.memory.lock().commit(batch_id) {
                Ok(ids) => {
                    committed_ids = ids;
                    run.pending_token = None;
                    run.ledger().append(
                        EventType::MemoryCommitted,
                        json!({ "batch_id": batch_id, "ids": committed_ids }),
                    )?;
                }
                Err(e) => {
                    // Abort: no episode file, no seal event, token cleared.
                    run.pending_token = None;
                    run.ledger().append(
                        EventType::WsUpdateRejected,
                        json!({
                            "reason": "episode_commit_failed",
                            "batch_id": batch_id,
                            "error": e.to_string(),
                        }),
                    )?;
                    return Err(e.into());
                }
            }
        }

        let covered = match run.ledger().last_sequence() {
            Some(last) if last >= ledger_from => run.ledger().read_range(ledger_from, last)?,
            _ => Vec::new(),
        };
        // The seal event has not been appended yet; under the run mutex its
        // sequence is knowable in advance and closes the span.
        let ledger_to = run.ledger().next_sequence();

        let episode = Episode {
            schema_version: SCHEMA_VERSION.to_string(),
            episode_id: EpisodeId::mint(),
            run_id: req.run_id.clone(),
            reason: req.reason.clone(),
            created_at: keel_core::time::now_iso(),
            ws_before: ws_before.clone(),
            ws_after: ws_before,
            ledger_span: keel_core::types::LedgerSpan { from_seq: ledger_from, to_seq: ledger_to },
            committed_memory_ids: committed_ids.clone(),
            next_entry_point: req.next_entry_point.clone().unwrap_or_default(),
            summary: summarize_events(&covered),
        };
        let path = write_episode(&episodes_dir, &episode)?;

        run.ledger().append(
            EventType::EpisodeSealed,
            json!({
                "episode_id": episode.episode_id,
                "ledger_from": ledger_from,
                "ledger_to": ledger_to,
                "committed_ids": committed_ids,
                "reason": req.reason,
            }),
        )?;

        info!(run_id = %req.run_id, episode_id = %episode.episode_id, "episode sealed");
        Ok(MilestoneResponse {
            episode_id: episode.episode_id,
            path,
            committed_ids,
            milestone_token: if req.memory_batch_id.is_some() { None } else { Some(token) },
        })
    }

    /// Snapshot a run into a relocatable resume pack.
    pub fn resume_snapshot(&self, req: &ResumeSnapshotRequest) -> Result<ResumeSnapshotResponse> {
        let handle = self.handle(&req.run_id)?;
        let run = handle.lock();

        let mut pointers = req.pointers.clone().unwrap_or_else(|| json!({}));
        if let Some(map) = pointers.as_object_mut() {
            map.insert("ledger_last_seq".to_string(), json!(run.ledger().last_sequence()));
        }

        let outcome = pack::snapshot(run.run_dir(), run.run_id(), req.zip_pack, pointers)?;
        run.ledger().append(
            EventType::ResumeSnapshot,
            json!({ "pack_id": outcome.pack_id, "path": outcome.path }),
        )?;

        Ok(ResumeSnapshotResponse {
            pack_id: outcome.pack_id,
            path: outcome.path,
            manifest: outcome.manifest,
        })
    }

    /// Reconstitute a run from a pack into a fresh run directory.
    pub fn resume_load(&self, req: &ResumeLoadRequest) -> Result<ResumeLoadResponse> {
        let outcome = pack::load(&req.pack_path, &self.config.runs_root, req.new_run_id.clone())?;

        let handle = Arc::new(Mutex::new(RunHandle::open(&self.config, outcome.run_id.clone())?));
        {
            let run = handle.lock();
            run.ledger().append(
                EventType::ResumeLoaded,
                json!({
                    "source_pack_id": outcome.pack_id,
                    "prior_run_id": outcome.prior_run_id,
                }),
            )?;
        }
        self.runs.lock().insert(outcome.run_id.clone(), handle);

        info!(run_id = %outcome.run_id, pack_id = %outcome.pack_id, "run resumed from pack");
        Ok(ResumeLoadResponse { run_id: outcome.run_id, ws: outcome.ws })
    }

    /// Liveness and version.
    #[must_use]
    pub fn health(&self) -> Health {
        Health { status: "ok".to_string(), version: env!("CARGO_PKG_VERSION").to_string() }
    }
}
