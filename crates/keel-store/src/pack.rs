//! Resume packs: portable, hash-manifested bundles of a run's state.
//!
//! A pack holds the working set, the full ledger, the latest episode, and
//! a manifest mapping each relative path to its SHA-256 and size. Packs
//! materialize as a directory or a zip, atomically (staged then renamed),
//! and restore into a fresh run directory after every file re-hashes
//! clean.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use keel_core::types::{FileDigest, PackManifest, WorkingSet};
use keel_core::{validate, PackId, RunId, ValidationError, SCHEMA_VERSION};

use crate::episode;
use crate::fsio::write_atomic;

/// Relative path of the working set inside a pack and a run directory.
pub const WS_REL_PATH: &str = "state/working_set.json";
/// Relative path of the ledger inside a pack and a run directory.
pub const LEDGER_REL_PATH: &str = "ledger/run.jsonl";
/// Relative path of the newest episode inside a pack.
pub const EPISODE_REL_PATH: &str = "episodes/latest.json";
/// Manifest filename at the pack root.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Errors from pack operations.
#[derive(Debug, Error)]
pub enum PackError {
    /// Underlying filesystem failure.
    #[error("pack io: {0}")]
    Io(#[from] io::Error),

    /// A document failed validation.
    #[error("pack schema: {0}")]
    Schema(#[from] ValidationError),

    /// A packed file is missing or its hash does not match the manifest.
    #[error("pack corrupt: {path}")]
    Corruption {
        /// Pack-relative path of the offending file.
        path: String,
    },

    /// The pack path does not exist.
    #[error("pack not found: {path}")]
    NotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// The target run directory already exists.
    #[error("run {run_id} already exists")]
    RunExists {
        /// The contested run id.
        run_id: RunId,
    },

    /// Zip archive failure.
    #[error("pack zip: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Result alias for pack operations.
pub type Result<T> = std::result::Result<T, PackError>;

/// Outcome of a snapshot.
#[derive(Debug)]
pub struct SnapshotOutcome {
    /// Minted pack id.
    pub pack_id: PackId,
    /// Path of the materialized pack (directory or `.zip`).
    pub path: PathBuf,
    /// The manifest, as written into the pack.
    pub manifest: PackManifest,
}

/// Outcome of a restore.
#[derive(Debug)]
pub struct LoadOutcome {
    /// The new run's id.
    pub run_id: RunId,
    /// The run the pack was snapshotted from.
    pub prior_run_id: RunId,
    /// The source pack's id.
    pub pack_id: PackId,
    /// The restored (and re-validated) working set.
    pub ws: WorkingSet,
}

fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Snapshot a run into a resume pack under `<run_dir>/resume/`.
///
/// The working set must validate before anything is copied. The pack is
/// staged in a temp directory and renamed into place, so a partially
/// written pack is never visible under its final name.
pub fn snapshot(
    run_dir: &Path,
    run_id: &RunId,
    zip_pack: bool,
    pointers: Value,
) -> Result<SnapshotOutcome> {
    let ws_path = run_dir.join(WS_REL_PATH);
    if !ws_path.exists() {
        return Err(PackError::NotFound { path: ws_path });
    }
    let ws_value: Value = serde_json::from_slice(&fs::read(&ws_path)?)
        .map_err(|e| ValidationError::at("/", format!("invalid json: {e}")))?;
    validate::working_set(&ws_value)?;

    let resume_dir = run_dir.join("resume");
    fs::create_dir_all(&resume_dir)?;
    let staging = tempfile::tempdir_in(&resume_dir)?;

    let mut sources: Vec<(&str, PathBuf)> = vec![(WS_REL_PATH, ws_path)];
    let ledger_path = run_dir.join(LEDGER_REL_PATH);
    if ledger_path.exists() {
        sources.push((LEDGER_REL_PATH, ledger_path));
    }
    if let Some((episode_path, _)) = episode::latest_episode(&run_dir.join("episodes"))
        .map_err(|e| match e {
            episode::EpisodeError::Io(e) => PackError::Io(e),
            episode::EpisodeError::Schema(e) => PackError::Schema(e),
        })?
    {
        sources.push((EPISODE_REL_PATH, episode_path));
    }

    let mut files = std::collections::BTreeMap::new();
    for (rel, src) in &sources {
        let dst = staging.path().join(rel);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, &dst)?;
        let (sha256, size) = sha256_file(&dst)?;
        files.insert((*rel).to_string(), FileDigest { sha256, size });
    }

    let pack_id = PackId::mint();
    let manifest = PackManifest {
        schema_version: SCHEMA_VERSION.to_string(),
        pack_id: pack_id.clone(),
        run_id: run_id.clone(),
        created_at: keel_core::time::now_iso(),
        files,
        pointers,
    };
    let mut manifest_bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    manifest_bytes.push(b'\n');
    write_atomic(&staging.path().join(MANIFEST_NAME), &manifest_bytes)?;

    let path = if zip_pack {
        let final_path = resume_dir.join(format!("{pack_id}.zip"));
        let tmp = tempfile::NamedTempFile::new_in(&resume_dir)?;
        write_zip(staging.path(), tmp.as_file())?;
        tmp.persist(&final_path).map_err(|e| PackError::Io(e.error))?;
        final_path
    } else {
        let final_path = resume_dir.join(pack_id.as_str());
        fs::rename(staging.keep(), &final_path)?;
        final_path
    };

    info!(pack_id = %pack_id, path = %path.display(), "resume pack snapshotted");
    Ok(SnapshotOutcome { pack_id, path, manifest })
}

fn write_zip(root: &Path, file: &File) -> Result<()> {
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();

    let mut stack = vec![root.to_path_buf()];
    let mut entries: Vec<PathBuf> = Vec::new();
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                entries.push(path);
            }
        }
    }
    // Deterministic member order regardless of directory iteration order.
    entries.sort();

    for path in entries {
        let rel = path
            .strip_prefix(root)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry escapes pack root"))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        writer.start_file(name, options)?;
        let mut src = File::open(&path)?;
        io::copy(&mut src, &mut writer)?;
    }
    writer.finish()?.sync_all()?;
    Ok(())
}

fn extract_zip(pack_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(pack_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(PackError::Corruption { path: entry.name().to_string() });
        };
        let out = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut dst = File::create(&out)?;
        io::copy(&mut entry, &mut dst)?;
        dst.flush()?;
    }
    Ok(())
}

/// Restore a pack into a fresh run directory under `runs_root`.
///
/// Every manifest entry is re-hashed before anything lands in the new run
/// directory; a mismatch fails with [`PackError::Corruption`] naming the
/// file. The restored working set is re-stamped with the new run id.
///
/// The caller appends the synthetic `RESUME_LOADED` ledger event once the
/// run is open.
pub fn load(pack_path: &Path, runs_root: &Path, new_run_id: Option<RunId>) -> Result<LoadOutcome> {
    if !pack_path.exists() {
        return Err(PackError::NotFound { path: pack_path.to_path_buf() });
    }

    // Zip packs extract into a temp dir first; directory packs are read in place.
    let extracted;
    let pack_root: &Path = if pack_path.extension().and_then(|e| e.to_str()) == Some("zip") {
        extracted = tempfile::tempdir()?;
        extract_zip(pack_path, extracted.path())?;
        extracted.path()
    } else {
        pack_path
    };

    let manifest_path = pack_root.join(MANIFEST_NAME);
    if !manifest_path.exists() {
        return Err(PackError::Corruption { path: MANIFEST_NAME.to_string() });
    }
    let manifest_value: Value = serde_json::from_slice(&fs::read(&manifest_path)?)
        .map_err(|e| ValidationError::at("/", format!("invalid json: {e}")))?;
    let manifest = validate::manifest(&manifest_value)?;

    for (rel, digest) in &manifest.files {
        let path = pack_root.join(rel);
        if !path.exists() {
            return Err(PackError::Corruption { path: rel.clone() });
        }
        let (sha256, size) = sha256_file(&path)?;
        if sha256 != digest.sha256 || size != digest.size {
            return Err(PackError::Corruption { path: rel.clone() });
        }
    }

    let run_id = new_run_id.unwrap_or_else(RunId::mint);
    let run_dir = runs_root.join(run_id.as_str());
    if run_dir.exists() {
        return Err(PackError::RunExists { run_id });
    }
    for sub in ["state", "ledger", "episodes", "resume"] {
        fs::create_dir_all(run_dir.join(sub))?;
    }

    for rel in manifest.files.keys() {
        let src = pack_root.join(rel);
        let dst = run_dir.join(rel);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src, &dst)?;
    }

    // Re-validate the restored working set and bind it to the new run.
    let ws_path = run_dir.join(WS_REL_PATH);
    if !ws_path.exists() {
        return Err(PackError::Corruption { path: WS_REL_PATH.to_string() });
    }
    let ws_value: Value = serde_json::from_slice(&fs::read(&ws_path)?)
        .map_err(|e| ValidationError::at("/", format!("invalid json: {e}")))?;
    let mut ws = validate::working_set(&ws_value)?;
    if ws.run_id != run_id {
        ws.run_id = run_id.clone();
        let mut bytes = serde_json::to_vec_pretty(&ws)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        bytes.push(b'\n');
        write_atomic(&ws_path, &bytes)?;
    }

    // The restored episode, if present, must also validate.
    let episode_path = run_dir.join(EPISODE_REL_PATH);
    if episode_path.exists() {
        let value: Value = serde_json::from_slice(&fs::read(&episode_path)?)
            .map_err(|e| ValidationError::at("/", format!("invalid json: {e}")))?;
        validate::episode(&value)?;
    }

    info!(pack_id = %manifest.pack_id, run_id = %run_id, "resume pack loaded");
    Ok(LoadOutcome {
        run_id,
        prior_run_id: manifest.run_id.clone(),
        pack_id: manifest.pack_id,
        ws,
    })
}
