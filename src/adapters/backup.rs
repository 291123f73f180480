use nix::sys::statvfs::statvfs;
use std::path::Path;
use tracing::{debug, warn};

use crate::core::sizing::BackupDestination;

/// Gather existence, writability and free-space facts about a backup
/// destination.
///
/// Writability is checked by creating and removing a probe file, since
/// permission bits alone do not account for read-only mounts.
pub fn probe_backup_destination(path: &Path) -> BackupDestination {
    let exists = path.is_dir();
    let writable = exists && can_write(path);
    let free_space = if exists { free_space(path) } else { None };

    debug!(
        path = %path.display(),
        exists,
        writable,
        ?free_space,
        "Probed backup destination"
    );

    BackupDestination {
        path: path.to_path_buf(),
        exists,
        writable,
        free_space,
    }
}

/// Bytes available to unprivileged users on the filesystem holding `dir`.
fn free_space(dir: &Path) -> Option<u64> {
    match statvfs(dir) {
        Ok(stats) => {
            let blocks = stats.blocks_available() as u64;
            Some(blocks.saturating_mul(stats.fragment_size() as u64))
        }
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "Could not determine free space");
            None
        }
    }
}

fn can_write(dir: &Path) -> bool {
    let probe = dir.join(format!(".livecopy-probe-{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
