// =============================================================================
// Process Lock — advisory single-instance guard
// =============================================================================
//
// Two service instances sharing one store would race the strategy state, so
// startup takes an advisory lock file holding the owner's pid. The file is
// created exclusively and removed on drop; a crash can leave it behind, in
// which case the error message names the stale pid for the operator.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock at `path`, failing if another holder exists.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let pid = std::process::id();
                writeln!(file, "{pid}")
                    .with_context(|| format!("writing pid to {}", path.display()))?;
                info!(path = %path.display(), pid, "process lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                bail!(
                    "another instance appears to be running (lock {} held by pid {holder}); \
                     remove the file if that process is gone",
                    path.display()
                );
            }
            Err(e) => {
                Err(e).with_context(|| format!("creating lock file {}", path.display()))
            }
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}
