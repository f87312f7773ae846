//! Atomic replacement of the installed binary.
//!
//! The running executable is never overwritten in place. The staged file is
//! moved over it with a rename, using a `.bak` slot as the single rollback
//! point:
//!
//! 1. `current` → `current.bak`
//! 2. `staged` → `current`
//! 3. set mode `0755` on `current`
//! 4. remove `current.bak`
//!
//! If step 2 fails, step 1 is reversed best-effort and the old binary keeps
//! running.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from the swap sequence.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("failed to back up current binary: {0}")]
    Backup(#[source] io::Error),

    /// The staged file could not be moved into place. The previous binary
    /// has been restored if at all possible.
    #[error("failed to replace binary: {0}")]
    Replace(#[source] io::Error),

    #[error("failed to set executable permissions: {0}")]
    Permissions(#[source] io::Error),
}

fn backup_path(target: &Path) -> PathBuf {
    let mut os_string = target.to_path_buf().into_os_string();
    os_string.push(".bak");
    PathBuf::from(os_string)
}

/// Replaces `target` with `staged`. Blocking; run on a blocking thread.
pub(crate) fn swap_binary(target: &Path, staged: &Path) -> Result<(), SwapError> {
    let backup = backup_path(target);

    std::fs::rename(target, &backup).map_err(SwapError::Backup)?;

    if let Err(err) = std::fs::rename(staged, target) {
        if let Err(rollback_err) = std::fs::rename(&backup, target) {
            warn!(error = %rollback_err, "rollback of binary backup failed");
        }
        return Err(SwapError::Replace(err));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755))
            .map_err(SwapError::Permissions)?;
    }

    if let Err(err) = std::fs::remove_file(&backup) {
        warn!(error = %err, "failed to remove binary backup");
    }

    info!(target = %target.display(), "binary replaced");
    Ok(())
}
