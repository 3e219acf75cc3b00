//! Wire-level error kinds.
//!
//! Every error surfaced by the service maps onto one of these kinds in the
//! uniform envelope `{ok: false, error, kind, details?}`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of wire error kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; not retryable.
    Schema,
    /// `_update_seq` mismatch; refetch and retry with a fresh sequence.
    Conflict,
    /// Unknown run, item, or pack path; not retryable.
    NotFound,
    /// Memory commit attempted without a valid milestone token.
    Gate,
    /// Ledger or pack integrity failure; operator action required.
    Corruption,
    /// Filesystem failure; retry is idempotent under the CAS.
    Io,
    /// Pinned cap or token budget cannot be satisfied.
    Overflow,
    /// Batch id the store does not recognize.
    UnknownBatch,
}

impl ErrorKind {
    /// The wire string for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Gate => "gate",
            Self::Corruption => "corruption",
            Self::Io => "io",
            Self::Overflow => "overflow",
            Self::UnknownBatch => "unknown_batch",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
