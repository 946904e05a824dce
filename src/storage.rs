#![forbid(unsafe_code)]

//! Checks that a target directory exists, is writable, and has enough free
//! space before a download is allowed to start.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use nix::sys::statvfs::statvfs;
use nix::unistd::{AccessFlags, access};

/// Free space the orchestrator demands before starting a download.
pub const REQUIRED_FREE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The OS refused to create the directory.
    PermissionDenied,
    /// The directory exists but is not writable by this process.
    NotWritable,
    /// Any other OS-level failure.
    Io,
}

#[derive(Debug, Clone)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StorageError {}

/// Creates `path` (and parents) if missing, then verifies it is writable.
/// Idempotent: an already-valid directory passes unchanged.
pub fn ensure_writable_directory(path: &Path) -> Result<(), StorageError> {
    if let Err(err) = fs::create_dir_all(path) {
        return Err(match err.kind() {
            io::ErrorKind::PermissionDenied => StorageError::new(
                StorageErrorKind::PermissionDenied,
                format!("Permission denied creating directory: {}", path.display()),
            ),
            _ => StorageError::new(
                StorageErrorKind::Io,
                format!("Error creating directory {}: {err}", path.display()),
            ),
        });
    }

    if access(path, AccessFlags::W_OK).is_err() {
        return Err(StorageError::new(
            StorageErrorKind::NotWritable,
            format!("Directory {} is not writable", path.display()),
        ));
    }

    Ok(())
}

/// Returns whether the filesystem holding `path` has at least
/// `required_bytes` free. A failed query never blocks the caller; it is
/// logged and treated as "enough".
pub fn has_free_space(path: &Path, required_bytes: u64) -> bool {
    match statvfs(path) {
        Ok(stat) => {
            let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            free >= required_bytes
        }
        Err(err) => {
            eprintln!(
                "Warning: could not check disk space for {}: {err}",
                path.display()
            );
            true
        }
    }
}
