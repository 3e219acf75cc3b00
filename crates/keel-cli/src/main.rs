//! Keel command-line entry point.
//!
//! `keel demo` walks one full run lifecycle against a local runs
//! directory: boot, one working-set patch, the rendered context brief, a
//! sealed milestone, and a resume-pack snapshot.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;

use keel_runtime::service::{BootRequest, MilestoneRequest, ResumeSnapshotRequest};
use keel_runtime::{Config, Service};

#[derive(Parser)]
#[command(name = "keel", version, about = "Crash-safe run-state engine for agent sessions")]
struct Cli {
    /// Log level (overridden by RUST_LOG).
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a demo run and walk it through one full lifecycle.
    Demo {
        /// Root directory for runs.
        #[arg(long, default_value = "runs")]
        root: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    keel_core::logging::init_subscriber(&cli.log_level);

    let result = match cli.command {
        Command::Demo { root } => demo(root),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {} ({})", e, e.kind());
            ExitCode::FAILURE
        }
    }
}

fn demo(root: PathBuf) -> Result<(), keel_runtime::ServiceError> {
    let service = Service::new(Config { runs_root: root, ..Default::default() });

    let booted = service.boot(&BootRequest {
        objective: "Walk one run through boot, patch, milestone, and snapshot.".to_string(),
        acceptance_criteria: vec![
            "working set patches apply".to_string(),
            "the ledger records every step".to_string(),
        ],
        constraints: vec!["memory commits only at milestones".to_string()],
        task_id: None,
        thread_id: None,
    })?;
    println!("booted run {}", booted.run_id);

    let patch = json!({
        "_schema_version": "2.1",
        "expected_seq": 0,
        "set": {
            "status": "BUSY",
            "current_stage": "PLAN",
            "next_action": "sketch the module layout",
        },
        "sliding_append": [{
            "id": "ctx-1",
            "content": "The run directory holds state, ledger, episodes, and resume packs.",
            "timestamp": keel_core::time::now_iso(),
            "priority": 2,
        }],
    });
    let applied = service.apply_patch(&booted.run_id, &patch)?;

    println!("\n--- context brief ---\n");
    println!("{}", applied.context_brief);

    let sealed = service.milestone(&MilestoneRequest {
        run_id: booted.run_id.clone(),
        reason: "demo checkpoint".to_string(),
        memory_batch_id: None,
        next_entry_point: Some("continue from PLAN".to_string()),
    })?;
    println!("sealed episode {} at {}", sealed.episode_id, sealed.path.display());

    let snapshot = service.resume_snapshot(&ResumeSnapshotRequest {
        run_id: booted.run_id.clone(),
        zip_pack: true,
        pointers: None,
    })?;
    println!("resume pack {} at {}", snapshot.pack_id, snapshot.path.display());

    service.shutdown();
    Ok(())
}
