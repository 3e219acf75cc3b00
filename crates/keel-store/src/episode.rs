//! Episode documents: immutable milestone checkpoints.
//!
//! An episode embeds full working-set copies (before and after), the
//! inclusive ledger span it covers, and a deterministic summary of the
//! covered events. Files are written once, atomically, and never touched
//! again.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use keel_core::types::{Episode, LedgerEvent};
use keel_core::{validate, ValidationError};

use crate::fsio::write_atomic;

/// Number of trailing events quoted in an episode summary.
const SUMMARY_TAIL: usize = 5;

/// Character cap on the rendered summary.
const SUMMARY_MAX_CHARS: usize = 1200;

/// Errors from episode operations.
#[derive(Debug, Error)]
pub enum EpisodeError {
    /// Underlying filesystem failure.
    #[error("episode io: {0}")]
    Io(#[from] io::Error),

    /// The document failed validation.
    #[error("episode schema: {0}")]
    Schema(#[from] ValidationError),
}

/// Result alias for episode operations.
pub type Result<T> = std::result::Result<T, EpisodeError>;

/// Deterministic, non-LLM summary of a slice of ledger events:
/// per-type counts in name order, then the last few events.
#[must_use]
pub fn summarize_events(events: &[LedgerEvent]) -> String {
    let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
    for event in events {
        *counts.entry(event.event_type.as_str()).or_default() += 1;
    }

    let mut parts = vec!["Event counts:".to_string()];
    for (name, count) in &counts {
        parts.push(format!("- {name}: {count}"));
    }

    parts.push(String::new());
    parts.push("Last events:".to_string());
    let tail_start = events.len().saturating_sub(SUMMARY_TAIL);
    for event in &events[tail_start..] {
        parts.push(format!(
            "- [{}] {} @ {}",
            event.sequence_id,
            event.event_type.as_str(),
            event.timestamp
        ));
    }

    let mut summary = parts.join("\n");
    if summary.len() > SUMMARY_MAX_CHARS {
        let mut end = SUMMARY_MAX_CHARS;
        while !summary.is_char_boundary(end) {
            end -= 1;
        }
        summary.truncate(end);
    }
    summary
}

/// Validate and atomically write an episode to
/// `<episodes_dir>/<episode_id>.json`.
pub fn write_episode(episodes_dir: &Path, episode: &Episode) -> Result<PathBuf> {
    let value = serde_json::to_value(episode)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let episode = validate::episode(&value)?;

    let path = episodes_dir.join(format!("{}.json", episode.episode_id));
    let mut bytes = serde_json::to_vec_pretty(&episode)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    bytes.push(b'\n');
    write_atomic(&path, &bytes)?;
    Ok(path)
}

/// Load the most recent episode in a directory, if any.
///
/// Episode ids are time-ordered (UUID v7), so the lexicographically
/// largest filename is the newest.
pub fn latest_episode(episodes_dir: &Path) -> Result<Option<(PathBuf, Episode)>> {
    if !episodes_dir.exists() {
        return Ok(None);
    }
    let mut newest: Option<PathBuf> = None;
    for entry in std::fs::read_dir(episodes_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if newest.as_ref().map_or(true, |n| path > *n) {
            newest = Some(path);
        }
    }
    let Some(path) = newest else { return Ok(None) };

    let bytes = std::fs::read(&path)?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| ValidationError::at("/", format!("invalid json: {e}")))?;
    let episode = validate::episode(&value)?;
    Ok(Some((path, episode)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ids::{EpisodeId, RunId, TaskId, ThreadId};
    use keel_core::types::{EventType, LedgerSpan, WorkingSet};

    fn sample_ws() -> WorkingSet {
        WorkingSet::initial(
            RunId::from("run_1"),
            TaskId::from("task_1"),
            ThreadId::from("thread_1"),
            "obj".to_string(),
            vec![],
            vec![],
        )
    }

    fn sample_episode(id: &str) -> Episode {
        let ws = sample_ws();
        Episode {
            schema_version: "2.1".to_string(),
            episode_id: EpisodeId::from(id),
            run_id: RunId::from("run_1"),
            reason: "checkpoint".to_string(),
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            ws_before: ws.clone(),
            ws_after: ws,
            ledger_span: LedgerSpan { from_seq: 0, to_seq: 1 },
            committed_memory_ids: vec![],
            next_entry_point: String::new(),
            summary: "Event counts:".to_string(),
        }
    }

    fn event_at(seq: u64, ty: EventType) -> LedgerEvent {
        LedgerEvent::at(seq, ty, RunId::from("run_1"), serde_json::json!({}))
    }

    #[test]
    fn summary_counts_types_in_name_order() {
        let events = vec![
            event_at(0, EventType::Boot),
            event_at(1, EventType::WsUpdateApplied),
            event_at(2, EventType::WsUpdateApplied),
        ];
        let summary = summarize_events(&events);
        assert!(summary.starts_with("Event counts:\n- BOOT: 1\n- WS_UPDATE_APPLIED: 2"));
        assert!(summary.contains("Last events:"));
    }

    #[test]
    fn summary_is_deterministic() {
        let events = vec![event_at(0, EventType::Boot), event_at(1, EventType::MemoryProposed)];
        assert_eq!(summarize_events(&events), summarize_events(&events));
    }

    #[test]
    fn summary_quotes_at_most_five_tail_events() {
        let events: Vec<LedgerEvent> =
            (0..10).map(|i| event_at(i, EventType::WsUpdateApplied)).collect();
        let summary = summarize_events(&events);
        assert!(!summary.contains("- [4]"));
        assert!(summary.contains("- [5]"));
        assert!(summary.contains("- [9]"));
    }

    #[test]
    fn write_then_latest_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let episodes_dir = dir.path().join("episodes");

        let older = sample_episode("ep_01");
        let newer = sample_episode("ep_02");
        write_episode(&episodes_dir, &older).unwrap();
        write_episode(&episodes_dir, &newer).unwrap();

        let (_, latest) = latest_episode(&episodes_dir).unwrap().unwrap();
        assert_eq!(latest.episode_id, newer.episode_id);
    }

    #[test]
    fn latest_of_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_episode(&dir.path().join("episodes")).unwrap().is_none());
    }

    #[test]
    fn invalid_span_is_rejected_at_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut episode = sample_episode("ep_bad");
        episode.ledger_span = LedgerSpan { from_seq: 5, to_seq: 2 };
        assert!(matches!(
            write_episode(&dir.path().join("episodes"), &episode),
            Err(EpisodeError::Schema(_))
        ));
    }
}
