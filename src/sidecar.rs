#![forbid(unsafe_code)]

//! Per-item JSON sidecar records stored next to each media file.
//!
//! A sidecar is written once after a successful acquisition and is read-only
//! afterwards except for deletion. Readers treat missing or corrupt files as
//! "absent" and fall back to filesystem timestamps.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File extension for sidecar records, shared with the catalog and the
/// delete endpoint.
pub const SIDECAR_EXTENSION: &str = "meta";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSidecar {
    /// Epoch seconds at acquisition time.
    pub download_date: f64,
    pub has_transcript: bool,
    pub original_title: String,
    pub sanitized_title: String,
    pub source_url: String,
}

pub fn sidecar_path(dir: &Path, base_name: &str) -> PathBuf {
    dir.join(format!("{base_name}.{SIDECAR_EXTENSION}"))
}

/// Serializes the record atomically (temp file + rename) so a concurrent
/// catalog walk never observes a half-written sidecar.
pub fn write_sidecar(dir: &Path, base_name: &str, record: &MetadataSidecar) -> Result<()> {
    let path = sidecar_path(dir, base_name);
    let payload = serde_json::to_vec_pretty(record).context("serializing sidecar record")?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("finalizing {}", path.display()))?;
    Ok(())
}

/// Reads the sidecar for `base_name`. Missing files and unparseable JSON
/// both yield `None`.
pub fn read_sidecar(dir: &Path, base_name: &str) -> Option<MetadataSidecar> {
    let raw = fs::read_to_string(sidecar_path(dir, base_name)).ok()?;
    serde_json::from_str(&raw).ok()
}
