//! Typed validation of untrusted documents.
//!
//! Every function parses a raw JSON value into its strict model type
//! (unknown fields rejected by serde) and then applies the range checks
//! the type system can't express: confidence bounds, unique context-item
//! ids, per-op MCR requirements, relative manifest paths.
//!
//! Errors carry a JSON-pointer-style location plus a message.

use serde_json::Value;
use thiserror::Error;

use crate::types::{
    Episode, LedgerEvent, Mcr, McrOp, MemoryItem, MemoryScope, PackManifest, WorkingSet, WsPatch,
};
use crate::SCHEMA_VERSION;

/// A validation failure: where and why.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{pointer}: {message}")]
pub struct ValidationError {
    /// JSON-pointer-style location of the offending field (`/` = root).
    pub pointer: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationError {
    /// Build an error at the given pointer.
    #[must_use]
    pub fn at(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self { pointer: pointer.into(), message: message.into() }
    }
}

/// Result alias for validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn parse<T: serde::de::DeserializeOwned>(doc: &Value) -> ValidationResult<T> {
    serde_json::from_value(doc.clone()).map_err(|e| ValidationError::at("/", e.to_string()))
}

fn check_schema_version(pointer: &str, version: &str) -> ValidationResult<()> {
    if version == SCHEMA_VERSION {
        Ok(())
    } else {
        Err(ValidationError::at(
            pointer,
            format!("unsupported schema version {version:?}, expected {SCHEMA_VERSION:?}"),
        ))
    }
}

fn check_confidence(pointer: &str, confidence: f64) -> ValidationResult<()> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(ValidationError::at(
            pointer,
            format!("confidence {confidence} outside [0, 1]"),
        ))
    }
}

/// Parse and validate a working-set document.
///
/// Beyond the strict parse: the schema version must match and context-item
/// ids must be unique across pinned and sliding context.
pub fn working_set(doc: &Value) -> ValidationResult<WorkingSet> {
    let ws: WorkingSet = parse(doc)?;
    check_schema_version("/_schema_version", &ws.schema_version)?;
    let mut seen = std::collections::HashSet::new();
    for (list, name) in [
        (&ws.pinned_context, "pinned_context"),
        (&ws.sliding_context, "sliding_context"),
    ] {
        for (idx, item) in list.iter().enumerate() {
            if item.id.is_empty() {
                return Err(ValidationError::at(
                    format!("/{name}/{idx}/id"),
                    "context item id must be non-empty",
                ));
            }
            if !seen.insert(item.id.clone()) {
                return Err(ValidationError::at(
                    format!("/{name}/{idx}/id"),
                    format!("duplicate context item id {:?}", item.id),
                ));
            }
        }
    }
    Ok(ws)
}

/// Parse and validate a working-set patch.
pub fn ws_patch(doc: &Value) -> ValidationResult<WsPatch> {
    let patch: WsPatch = parse(doc)?;
    check_schema_version("/_schema_version", &patch.schema_version)?;
    for (list, name) in [
        (&patch.pinned_append, "pinned_append"),
        (&patch.sliding_append, "sliding_append"),
    ] {
        for (idx, item) in list.iter().enumerate() {
            if item.id.is_empty() {
                return Err(ValidationError::at(
                    format!("/{name}/{idx}/id"),
                    "context item id must be non-empty",
                ));
            }
        }
    }
    Ok(patch)
}

/// Parse and validate one ledger event.
pub fn ledger_event(doc: &Value) -> ValidationResult<LedgerEvent> {
    let event: LedgerEvent = parse(doc)?;
    check_schema_version("/_schema_version", &event.schema_version)?;
    Ok(event)
}

/// Parse and validate a memory item.
pub fn memory_item(doc: &Value) -> ValidationResult<MemoryItem> {
    let item: MemoryItem = parse(doc)?;
    check_schema_version("/_schema_version", &item.schema_version)?;
    check_confidence("/confidence", item.confidence)?;
    if item.scope != MemoryScope::Global && item.scope_ref.is_none() {
        return Err(ValidationError::at(
            "/scope_ref",
            format!("scope {:?} requires a scope_ref", item.scope),
        ));
    }
    Ok(item)
}

/// Parse and validate a memory change request against its op's requirements.
pub fn mcr(doc: &Value) -> ValidationResult<Mcr> {
    let mcr: Mcr = parse(doc)?;
    match mcr.op {
        McrOp::Add => {
            for (present, field) in [
                (mcr.kind.is_some(), "type"),
                (mcr.scope.is_some(), "scope"),
                (mcr.content.is_some(), "content"),
                (mcr.confidence.is_some(), "confidence"),
                (mcr.rationale.is_some(), "rationale"),
            ] {
                if !present {
                    return Err(ValidationError::at(
                        format!("/{field}"),
                        format!("{field} is required for op=add"),
                    ));
                }
            }
        }
        McrOp::Update | McrOp::Retract => {
            if mcr.target_id.is_none() {
                return Err(ValidationError::at(
                    "/target_id",
                    format!("target_id is required for op={:?}", mcr.op).to_lowercase(),
                ));
            }
        }
    }
    if let Some(confidence) = mcr.confidence {
        check_confidence("/confidence", confidence)?;
    }
    Ok(mcr)
}

/// Parse and validate an episode document.
pub fn episode(doc: &Value) -> ValidationResult<Episode> {
    let episode: Episode = parse(doc)?;
    check_schema_version("/_schema_version", &episode.schema_version)?;
    if episode.ledger_span.from_seq > episode.ledger_span.to_seq {
        return Err(ValidationError::at(
            "/ledger_span",
            format!(
                "from_seq {} exceeds to_seq {}",
                episode.ledger_span.from_seq, episode.ledger_span.to_seq
            ),
        ));
    }
    if episode.ws_before.update_seq > episode.ws_after.update_seq {
        return Err(ValidationError::at(
            "/ws_after/_update_seq",
            "ws_after is older than ws_before",
        ));
    }
    Ok(episode)
}

/// Parse and validate a resume-pack manifest.
///
/// Paths must be relative with no parent traversal; digests must be
/// 64 hex characters.
pub fn manifest(doc: &Value) -> ValidationResult<PackManifest> {
    let manifest: PackManifest = parse(doc)?;
    check_schema_version("/_schema_version", &manifest.schema_version)?;
    for (path, digest) in &manifest.files {
        let p = std::path::Path::new(path);
        if p.is_absolute() || path.starts_with('/') {
            return Err(ValidationError::at(
                format!("/files/{path}"),
                "manifest paths must be relative",
            ));
        }
        if p.components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ValidationError::at(
                format!("/files/{path}"),
                "manifest paths must not traverse upward",
            ));
        }
        if digest.sha256.len() != 64 || !digest.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ValidationError::at(
                format!("/files/{path}/sha256"),
                "sha256 must be 64 hex characters",
            ));
        }
    }
    Ok(manifest)
}
