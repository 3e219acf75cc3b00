//! Service errors and the uniform wire envelope.
//!
//! Every lower-layer error maps onto one [`ErrorKind`] so callers see the
//! same shape regardless of which subsystem failed:
//! `{ok: false, error, kind, details?}`.

use std::io;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use keel_core::{BatchId, ErrorKind, ValidationError};
use keel_store::ledger::LedgerError;
use keel_store::memory::MemoryError;
use keel_store::episode::EpisodeError;
use keel_store::pack::PackError;
use keel_store::ws::WsError;

/// Top-level service error.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed input.
    #[error("schema: {0}")]
    Schema(#[from] ValidationError),

    /// Optimistic-concurrency or state conflict.
    #[error("conflict: {message}")]
    Conflict {
        /// What conflicted.
        message: String,
        /// Current `_update_seq`, when the conflict is a stale patch.
        current_seq: Option<u64>,
    },

    /// Unknown run, item, or path.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing.
        message: String,
    },

    /// Milestone gate refused a memory commit.
    #[error("gate: {message}")]
    Gate {
        /// Why the gate refused.
        message: String,
    },

    /// Ledger or pack integrity failure.
    #[error("corruption: {message}")]
    Corruption {
        /// Where the corruption was detected.
        message: String,
    },

    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Pinned cap or token budget cannot hold.
    #[error("overflow: {message}")]
    Overflow {
        /// Which limit failed.
        message: String,
    },

    /// Batch id the store does not recognize.
    #[error("unknown batch {batch_id}")]
    UnknownBatch {
        /// The unrecognized batch.
        batch_id: BatchId,
    },
}

impl ServiceError {
    /// The wire kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema(_) => ErrorKind::Schema,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Gate { .. } => ErrorKind::Gate,
            Self::Corruption { .. } => ErrorKind::Corruption,
            Self::Io(_) => ErrorKind::Io,
            Self::Overflow { .. } => ErrorKind::Overflow,
            Self::UnknownBatch { .. } => ErrorKind::UnknownBatch,
        }
    }

    /// Render the uniform wire envelope.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            Self::Conflict { current_seq: Some(seq), .. } => {
                Some(serde_json::json!({ "current_seq": seq }))
            }
            Self::UnknownBatch { batch_id } => {
                Some(serde_json::json!({ "batch_id": batch_id }))
            }
            _ => None,
        };
        ErrorBody { ok: false, error: self.to_string(), kind: self.kind(), details }
    }
}

/// The uniform error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub ok: bool,
    /// Human-readable message.
    pub error: String,
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Kind-specific extras.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Result alias for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

impl From<WsError> for ServiceError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::AlreadyExists => {
                Self::Conflict { message: e.to_string(), current_seq: None }
            }
            WsError::NotFound => Self::NotFound { message: e.to_string() },
            WsError::Io(e) => Self::Io(e),
            WsError::Schema(e) => Self::Schema(e),
            WsError::Conflict { current_seq } => Self::Conflict {
                message: format!("stale patch: current _update_seq is {current_seq}"),
                current_seq: Some(current_seq),
            },
            WsError::DuplicateItem { ref id } => Self::Schema(ValidationError::at(
                "/",
                format!("duplicate context item id {id:?}"),
            )),
            WsError::PinnedOverflow { .. } | WsError::BudgetExceeded { .. } => {
                Self::Overflow { message: e.to_string() }
            }
            WsError::Ledger(e) => e.into(),
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Io(e) => Self::Io(e),
            LedgerError::Schema(e) => Self::Schema(e),
            LedgerError::Corruption { .. } => Self::Corruption { message: e.to_string() },
        }
    }
}

impl From<MemoryError> for ServiceError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::Schema(e) => Self::Schema(e),
            MemoryError::UnknownBatch { batch_id } => Self::UnknownBatch { batch_id },
            MemoryError::NotFound { .. } => Self::NotFound { message: e.to_string() },
            MemoryError::InvalidTransition { .. } => {
                Self::Conflict { message: e.to_string(), current_seq: None }
            }
        }
    }
}

impl From<PackError> for ServiceError {
    fn from(e: PackError) -> Self {
        match e {
            PackError::Io(e) => Self::Io(e),
            PackError::Schema(e) => Self::Schema(e),
            PackError::Corruption { .. } | PackError::Zip(_) => {
                Self::Corruption { message: e.to_string() }
            }
            PackError::NotFound { .. } => Self::NotFound { message: e.to_string() },
            PackError::RunExists { .. } => {
                Self::Conflict { message: e.to_string(), current_seq: None }
            }
        }
    }
}

impl From<EpisodeError> for ServiceError {
    fn from(e: EpisodeError) -> Self {
        match e {
            EpisodeError::Io(e) => Self::Io(e),
            EpisodeError::Schema(e) => Self::Schema(e),
        }
    }
}
