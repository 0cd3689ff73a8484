//! Advisory lock guarding the store file

use crate::error::{StratumError, StratumResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Poll interval while another process holds the lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held lock on the store; the marker file is removed on drop.
///
/// Not re-entrant: acquiring twice from the same task waits forever.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    /// Wait until the marker file can be created, then write our pid into it
    pub async fn acquire(path: &Path) -> StratumResult<Self> {
        let mut announced = false;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let pid = std::process::id().to_string();
                    file.write_all(pid.as_bytes())
                        .await
                        .map_err(|e| StratumError::io(format!("writing lock {}", path.display()), e))?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !announced {
                        debug!("Waiting for store lock {} (held by pid {})", path.display(), holder_pid(path));
                        announced = true;
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(StratumError::io(
                        format!("creating lock {}", path.display()),
                        e,
                    ))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock {}: {}", self.path.display(), e),
        }
    }
}

fn holder_pid(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "?".to_string())
}
