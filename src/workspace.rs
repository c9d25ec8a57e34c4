//! Per-run directory layout and teardown.
//!
//! ```text
//! <runs_dir>/<run_number>/
//!     work/        checkout, .env, output tree   (removed at teardown)
//!     artifacts/   archived reports              (kept until retention)
//!     run.log      redacted run log              (kept until retention)
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Scratch and output directories for one run.
///
/// Dropping the workspace tears down `work/`, so the credential file and
/// the checkout never outlive the run, even on an early return or panic.
#[derive(Debug)]
pub struct RunWorkspace {
    root: PathBuf,
    work: PathBuf,
    artifacts: PathBuf,
    log_path: PathBuf,
    secret_path: Option<PathBuf>,
    torn_down: bool,
}

impl RunWorkspace {
    /// Create a fresh workspace for run `number`, clearing leftovers from a
    /// previous run with the same number.
    pub fn create(runs_dir: &Path, number: u64) -> io::Result<Self> {
        let root = run_dir(runs_dir, number);
        if root.exists() {
            warn!(path = %root.display(), "removing stale run directory");
            fs::remove_dir_all(&root)?;
        }
        let work = root.join("work");
        let artifacts = artifacts_dir(runs_dir, number);
        fs::create_dir_all(&work)?;
        fs::create_dir_all(&artifacts)?;
        Ok(Self {
            log_path: root.join("run.log"),
            root,
            work,
            artifacts,
            secret_path: None,
            torn_down: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn work_dir(&self) -> &Path {
        &self.work
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Remember where the credential file was written so teardown removes it
    /// before anything else.
    pub fn register_secret(&mut self, path: PathBuf) {
        self.secret_path = Some(path);
    }

    /// Remove the credential file and the work tree. Idempotent.
    pub fn teardown(&mut self) -> io::Result<()> {
        if self.torn_down {
            return Ok(());
        }
        if let Some(secret) = self.secret_path.take() {
            match fs::remove_file(&secret) {
                Ok(()) => debug!(path = %secret.display(), "credential file removed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if self.work.exists() {
            fs::remove_dir_all(&self.work)?;
        }
        self.torn_down = true;
        Ok(())
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(path = %self.work.display(), error = %e, "workspace teardown failed");
        }
    }
}

/// Directory that holds everything belonging to run `number`.
pub fn run_dir(runs_dir: &Path, number: u64) -> PathBuf {
    runs_dir.join(number.to_string())
}

/// Where the artifacts of run `number` are archived.
pub fn artifacts_dir(runs_dir: &Path, number: u64) -> PathBuf {
    run_dir(runs_dir, number).join("artifacts")
}
