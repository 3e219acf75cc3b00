//! Per-run handles.
//!
//! A [`RunHandle`] groups everything serialized by one run's mutex: the
//! working-set manager, the ledger handle, and the pending milestone
//! token. The runtime owns a map `run_id → Arc<Mutex<RunHandle>>`; no two
//! runs share any file.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use keel_core::types::WorkingSet;
use keel_core::{MilestoneToken, RunId};
use keel_store::memory::Viewer;
use keel_store::pack::{LEDGER_REL_PATH, WS_REL_PATH};
use keel_store::{RunLedger, WorkingSetManager};

use crate::config::Config;
use crate::error::Result;

/// How long a minted milestone token stays consumable.
pub const MILESTONE_TOKEN_TTL: Duration = Duration::from_secs(300);

/// The milestone token currently pending for a run, if any.
///
/// At most one exists per run; minting a new one invalidates the old.
/// Expiry is checked at consumption; there are no background timers.
#[derive(Debug)]
pub struct PendingToken {
    token: MilestoneToken,
    issued_at: Instant,
}

impl PendingToken {
    /// Mint a fresh pending token.
    #[must_use]
    pub fn mint() -> Self {
        Self { token: MilestoneToken::mint(), issued_at: Instant::now() }
    }

    /// The token value handed to the caller.
    #[must_use]
    pub fn token(&self) -> &MilestoneToken {
        &self.token
    }

    /// Whether `presented` matches this token and it has not expired.
    #[must_use]
    pub fn accepts(&self, presented: &MilestoneToken) -> bool {
        self.issued_at.elapsed() <= MILESTONE_TOKEN_TTL && &self.token == presented
    }
}

/// Everything one run's mutex guards.
pub struct RunHandle {
    run_id: RunId,
    run_dir: PathBuf,
    ws: WorkingSetManager,
    ledger: RunLedger,
    /// Pending milestone token; `None` when no seal is outstanding.
    pub pending_token: Option<PendingToken>,
}

impl RunHandle {
    /// Open (or create) the run's on-disk layout and handles.
    ///
    /// Opening primes the ledger sequence counter and, when a working set
    /// already exists, reconciles it against the ledger.
    pub fn open(config: &Config, run_id: RunId) -> Result<Self> {
        let run_dir = config.run_dir(&run_id);
        for sub in ["state", "ledger", "episodes", "resume"] {
            std::fs::create_dir_all(run_dir.join(sub))?;
        }

        let ledger = RunLedger::open(
            &run_dir.join(LEDGER_REL_PATH),
            run_id.clone(),
            config.ledger_lock_mode,
        )?;
        let ws = WorkingSetManager::new(
            run_dir.join(WS_REL_PATH),
            config.token_budget,
            config.pinned_max,
        );
        if ws.exists() {
            ws.load_and_reconcile(&ledger)?;
        }

        Ok(Self { run_id, run_dir, ws, ledger, pending_token: None })
    }

    /// The run's id.
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// The run's directory.
    #[must_use]
    pub fn run_dir(&self) -> &PathBuf {
        &self.run_dir
    }

    /// The working-set manager.
    #[must_use]
    pub fn ws(&self) -> &WorkingSetManager {
        &self.ws
    }

    /// The run ledger.
    #[must_use]
    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    /// The identity used to resolve memory-scope visibility.
    #[must_use]
    pub fn viewer(ws: &WorkingSet) -> Viewer {
        Viewer {
            run_id: ws.run_id.clone(),
            task_id: ws.task_id.clone(),
            thread_id: ws.thread_id.clone(),
        }
    }
}
