//! Resume-pack manifests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{PackId, RunId};

/// Hash and size of one file inside a pack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDigest {
    /// Lowercase hex SHA-256 of the file bytes.
    pub sha256: String,
    /// File size in bytes.
    pub size: u64,
}

/// The `manifest.json` at a pack's root.
///
/// File paths are relative to the pack root; a `BTreeMap` keeps the
/// serialized order deterministic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackManifest {
    /// Always `"2.1"`.
    #[serde(rename = "_schema_version")]
    pub schema_version: String,
    /// Unique pack id.
    pub pack_id: PackId,
    /// The run this pack was snapshotted from.
    pub run_id: RunId,
    /// ISO-8601 UTC snapshot time.
    pub created_at: String,
    /// Relative path → digest for every packed file.
    pub files: BTreeMap<String, FileDigest>,
    /// Free-form opaque pointers (e.g. external ledger offsets).
    pub pointers: Value,
}
