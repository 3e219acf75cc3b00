//! The run ledger: an append-only JSONL event log.
//!
//! One file per run (`ledger/run.jsonl`), one JSON object per line.
//! Sequence ids are dense from 0 and assigned at append time; written
//! lines are never rewritten. Appenders within a process are serialized
//! by an internal mutex; cross-process writers by the advisory file lock
//! on the append handle.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use keel_core::types::{EventType, LedgerEvent};
use keel_core::{validate, RunId, ValidationError};

use crate::fsio::{AppendHandle, LockMode};

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Underlying filesystem failure.
    #[error("ledger io: {0}")]
    Io(#[from] io::Error),

    /// A line failed schema validation.
    #[error("ledger schema: {0}")]
    Schema(#[from] ValidationError),

    /// The first malformed line, by byte offset. Everything before the
    /// offset is intact; operator action required beyond it.
    #[error("ledger corrupt at byte offset {byte_offset}: {detail}")]
    Corruption {
        /// Byte offset of the first malformed line.
        byte_offset: u64,
        /// What went wrong at that offset.
        detail: String,
    },
}

/// Result alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug)]
struct LedgerInner {
    handle: AppendHandle,
    /// Sequence of the last appended event; `None` for an empty ledger.
    last_seq: Option<u64>,
}

/// Append-only event log for one run.
#[derive(Debug)]
pub struct RunLedger {
    path: PathBuf,
    run_id: RunId,
    inner: Mutex<LedgerInner>,
}

impl RunLedger {
    /// Open (or create) the ledger at `path`.
    ///
    /// Primes the sequence counter by scanning existing lines; a malformed
    /// or non-dense line fails the open with [`LedgerError::Corruption`].
    pub fn open(path: &Path, run_id: RunId, lock_mode: LockMode) -> Result<Self> {
        let last_seq = if path.exists() {
            let mut last = None;
            for event in scan(path)? {
                let event = event?;
                last = Some(event.sequence_id);
            }
            last
        } else {
            None
        };

        let handle = AppendHandle::open(path, lock_mode)?;
        debug!(path = %path.display(), ?last_seq, "ledger opened");

        Ok(Self {
            path: path.to_path_buf(),
            run_id,
            inner: Mutex::new(LedgerInner { handle, last_seq }),
        })
    }

    /// The ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence of the last appended event, if any.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.inner.lock().last_seq
    }

    /// The sequence the next append will receive.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.inner.lock().last_seq.map_or(0, |s| s + 1)
    }

    /// Append an event, assigning the next dense sequence id.
    ///
    /// The line is fsynced before the new sequence is published.
    pub fn append(&self, event_type: EventType, payload: Value) -> Result<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.last_seq.map_or(0, |s| s + 1);
        let event = LedgerEvent::at(seq, event_type, self.run_id.clone(), payload);
        let line = serde_json::to_string(&event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        inner.handle.append_line(&line)?;
        inner.last_seq = Some(seq);
        Ok(seq)
    }

    /// Stream every event from the start of the file.
    ///
    /// Iteration stops at the first malformed line, yielding
    /// [`LedgerError::Corruption`] with its byte offset.
    pub fn read_all(&self) -> Result<LedgerIter> {
        scan(&self.path)
    }

    /// Stream events whose sequence lies in `[from_seq, to_seq]` inclusive.
    pub fn read_range(&self, from_seq: u64, to_seq: u64) -> Result<Vec<LedgerEvent>> {
        let mut events = Vec::new();
        for event in self.read_all()? {
            let event = event?;
            if event.sequence_id > to_seq {
                break;
            }
            if event.sequence_id >= from_seq {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Collect all events into memory.
    pub fn collect_all(&self) -> Result<Vec<LedgerEvent>> {
        self.read_all()?.collect()
    }
}

fn scan(path: &Path) -> Result<LedgerIter> {
    let file = File::open(path)?;
    Ok(LedgerIter {
        reader: BufReader::new(file),
        byte_offset: 0,
        next_seq: 0,
        halted: false,
    })
}

/// Streaming ledger reader.
///
/// Yields events in file order, validating each line and the density of
/// sequence ids. After the first error, iteration ends.
pub struct LedgerIter {
    reader: BufReader<File>,
    byte_offset: u64,
    next_seq: u64,
    halted: bool,
}

impl Iterator for LedgerIter {
    type Item = Result<LedgerEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.halted {
            let mut line = String::new();
            let offset = self.byte_offset;
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(n) => {
                    self.byte_offset += n as u64;
                    if line.trim().is_empty() {
                        // Blank lines are tolerated (e.g. a pre-created empty file).
                        continue;
                    }
                    let result = parse_line(&line, offset, self.next_seq);
                    match &result {
                        Ok(_) => self.next_seq += 1,
                        Err(_) => self.halted = true,
                    }
                    return Some(result);
                }
                Err(e) => {
                    self.halted = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}

fn parse_line(line: &str, byte_offset: u64, expected_seq: u64) -> Result<LedgerEvent> {
    let value: Value = serde_json::from_str(line).map_err(|e| LedgerError::Corruption {
        byte_offset,
        detail: format!("invalid json: {e}"),
    })?;
    let event = validate::ledger_event(&value).map_err(|e| LedgerError::Corruption {
        byte_offset,
        detail: e.to_string(),
    })?;
    if event.sequence_id != expected_seq {
        return Err(LedgerError::Corruption {
            byte_offset,
            detail: format!(
                "sequence {} breaks density, expected {}",
                event.sequence_id, expected_seq
            ),
        });
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn open_ledger(dir: &Path) -> RunLedger {
        RunLedger::open(&dir.join("run.jsonl"), RunId::from("run_1"), LockMode::None).unwrap()
    }

    #[test]
    fn sequences_are_dense_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(dir.path());

        assert_eq!(ledger.append(EventType::Boot, serde_json::json!({})).unwrap(), 0);
        assert_eq!(
            ledger
                .append(EventType::WsUpdateApplied, serde_json::json!({"after_seq": 1}))
                .unwrap(),
            1
        );
        assert_eq!(ledger.last_sequence(), Some(1));
        assert_eq!(ledger.next_sequence(), 2);
    }

    #[test]
    fn reopen_primes_counter_from_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = open_ledger(dir.path());
            ledger.append(EventType::Boot, serde_json::json!({})).unwrap();
            ledger
                .append(EventType::WsUpdateApplied, serde_json::json!({}))
                .unwrap();
        }
        let ledger = open_ledger(dir.path());
        assert_eq!(ledger.last_sequence(), Some(1));
        assert_eq!(
            ledger.append(EventType::ResumeSnapshot, serde_json::json!({})).unwrap(),
            2
        );
    }

    #[test]
    fn read_range_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        for _ in 0..5 {
            ledger
                .append(EventType::WsUpdateApplied, serde_json::json!({}))
                .unwrap();
        }
        let events = ledger.read_range(1, 3).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn malformed_line_reports_byte_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        let ledger = RunLedger::open(&path, RunId::from("run_1"), LockMode::None).unwrap();
        ledger.append(EventType::Boot, serde_json::json!({})).unwrap();
        drop(ledger);

        let good_len = std::fs::metadata(&path).unwrap().len();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{ not json\n").unwrap();
        drop(file);

        let err = RunLedger::open(&path, RunId::from("run_1"), LockMode::None).unwrap_err();
        match err {
            LedgerError::Corruption { byte_offset, .. } => assert_eq!(byte_offset, good_len),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn gap_in_sequences_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        let ledger = RunLedger::open(&path, RunId::from("run_1"), LockMode::None).unwrap();
        ledger.append(EventType::Boot, serde_json::json!({})).unwrap();
        drop(ledger);

        // Forge an event that skips sequence 1.
        let forged = LedgerEvent::at(2, EventType::ResumeSnapshot, RunId::from("run_1"), serde_json::json!({}));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{}", serde_json::to_string(&forged).unwrap()).unwrap();
        drop(file);

        assert!(matches!(
            RunLedger::open(&path, RunId::from("run_1"), LockMode::None),
            Err(LedgerError::Corruption { .. })
        ));
    }

    #[test]
    fn events_carry_run_id_and_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open_ledger(dir.path());
        ledger.append(EventType::Boot, serde_json::json!({})).unwrap();
        let events = ledger.collect_all().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].run_id, RunId::from("run_1"));
        assert_eq!(events[0].schema_version, "2.1");
    }
}
