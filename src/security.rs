#![forbid(unsafe_code)]

//! Privilege guard shared by the tubeshelf binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to proceed when a binary is launched as root. The media tree is
/// meant to be owned by a regular service account; downloads running as root
/// would litter it with unreadable files.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use a regular user or a dedicated service account");
    }
    Ok(())
}
