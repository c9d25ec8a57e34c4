//! Single-flight guard: at most one active run, in this process and across
//! processes sharing the same runs directory.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Name of the advisory lock file inside the runs directory.
pub const LOCK_FILE: &str = ".lock";

/// Hands out at most one [`ActiveRun`] at a time.
#[derive(Debug, Clone)]
pub struct RunGuard {
    inner: Arc<Mutex<()>>,
    lock_path: PathBuf,
}

/// Proof that the holder is the only active run. Released on drop.
#[derive(Debug)]
pub struct ActiveRun {
    _guard: OwnedMutexGuard<()>,
    _lock: File,
}

impl RunGuard {
    pub fn new(runs_dir: &Path) -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
            lock_path: runs_dir.join(LOCK_FILE),
        }
    }

    /// Try to become the active run. `Ok(None)` means another run holds
    /// the guard; the caller drops its trigger instead of waiting.
    pub fn try_acquire(&self) -> Result<Option<ActiveRun>> {
        let guard = match self.inner.clone().try_lock_owned() {
            Ok(g) => g,
            Err(_) => return Ok(None),
        };

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("failed to open lock file {}", self.lock_path.display()))?;

        match lock.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                return Ok(None)
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to lock {}", self.lock_path.display())
                })
            }
        }

        // Record the holder for operators inspecting a stuck lock.
        lock.set_len(0)?;
        writeln!(lock, "{}", std::process::id())?;

        Ok(Some(ActiveRun {
            _guard: guard,
            _lock: lock,
        }))
    }

    /// Whether a run is active in this process.
    pub fn is_active(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
