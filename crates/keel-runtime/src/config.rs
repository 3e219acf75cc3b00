//! Service configuration.
//!
//! A plain struct with defaults, constructed by the caller and passed into
//! [`Service::new`](crate::Service::new). The test-mode flag lives here;
//! nothing deeper in the stack consults the environment.

use std::path::PathBuf;

use keel_store::LockMode;

/// Configuration for a [`Service`](crate::Service).
#[derive(Clone, Debug)]
pub struct Config {
    /// Root directory holding one subdirectory per run.
    pub runs_root: PathBuf,
    /// Token budget the working set must fit after eviction.
    pub token_budget: u64,
    /// Cap on pinned context items.
    pub pinned_max: usize,
    /// Cross-process serialization mode for ledger appends.
    pub ledger_lock_mode: LockMode,
    /// Enables the `allow_outside_milestone` commit bypass. Never set in
    /// production.
    pub test_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runs_root: PathBuf::from("./runs"),
            token_budget: 8192,
            pinned_max: 32,
            ledger_lock_mode: LockMode::Advisory,
            test_mode: false,
        }
    }
}

impl Config {
    /// Directory of one run.
    #[must_use]
    pub fn run_dir(&self, run_id: &keel_core::RunId) -> PathBuf {
        self.runs_root.join(run_id.as_str())
    }
}
