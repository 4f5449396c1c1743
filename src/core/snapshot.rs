//! Pre-apply snapshots of the live rules
//!
//! Before a mutating pass the raw `iptables-save` dump is written to the
//! state directory as `snapshot_<timestamp>.rules`, next to a `.sha256`
//! checksum. The file is valid `iptables-restore` input for manual
//! recovery. Only the newest [`MAX_SNAPSHOTS`] are kept.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::core::error::{Error, Result, SnapshotError};

pub const MAX_SNAPSHOTS: usize = 5;

const PREFIX: &str = "snapshot_";
const EXTENSION: &str = "rules";

/// SHA-256 of the text, as lowercase hex.
pub fn compute_checksum(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn checksum_path(path: &Path) -> PathBuf {
    path.with_extension(format!("{EXTENSION}.sha256"))
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        // Create file with restrictive permissions
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)?;
    }
    Ok(())
}

fn state_dir() -> Result<PathBuf> {
    crate::utils::ensure_dirs()?;
    crate::utils::get_state_dir()
        .ok_or_else(|| Error::Internal("Failed to get state directory".to_string()))
}

/// Saves a dump into `dir` and prunes old snapshots there.
pub fn save_snapshot_in(dir: &Path, dump: &str) -> Result<PathBuf> {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
    let path = dir.join(format!("{PREFIX}{timestamp}.{EXTENSION}"));

    write_private(&path, dump)?;
    write_private(&checksum_path(&path), &compute_checksum(dump))?;
    info!("Snapshot saved to {:?}", path);

    cleanup_old_snapshots(dir)?;
    Ok(path)
}

/// Saves a dump into the state directory.
pub fn save_snapshot(dump: &str) -> Result<PathBuf> {
    save_snapshot_in(&state_dir()?, dump)
}

/// Snapshots in `dir`, newest first.
pub fn list_snapshots_in(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(PREFIX) && n.ends_with(&format!(".{EXTENSION}")))
        })
        .collect();

    // Timestamps sort lexically
    snapshots.sort_by(|a, b| b.cmp(a));
    Ok(snapshots)
}

/// Snapshots in the state directory, newest first.
pub fn list_snapshots() -> Result<Vec<PathBuf>> {
    match crate::utils::get_state_dir() {
        Some(dir) => list_snapshots_in(&dir),
        None => Ok(Vec::new()),
    }
}

fn cleanup_old_snapshots(dir: &Path) -> Result<()> {
    let mut snapshots = list_snapshots_in(dir)?;
    if snapshots.len() > MAX_SNAPSHOTS {
        for snapshot in snapshots.drain(MAX_SNAPSHOTS..) {
            for path in [checksum_path(&snapshot), snapshot] {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove old snapshot {:?}: {}", path, e);
                }
            }
        }
    }
    Ok(())
}

/// Checks a snapshot against its `.sha256` sidecar.
pub fn verify_snapshot(path: &Path) -> Result<()> {
    let name = path.display().to_string();
    if !path.exists() {
        return Err(SnapshotError::NotFound(name).into());
    }
    let expected = match std::fs::read_to_string(checksum_path(path)) {
        Ok(sum) => sum.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SnapshotError::MissingChecksum(name).into());
        }
        Err(e) => return Err(e.into()),
    };
    let actual = compute_checksum(&std::fs::read_to_string(path)?);
    if expected == actual {
        Ok(())
    } else {
        Err(SnapshotError::ChecksumMismatch { expected, actual }.into())
    }
}
