//! Per-run log stream.
//!
//! Every line is timestamped, appended to `run.log` in the run directory,
//! and passed through a [`Redactor`] first so credential values loaded into
//! the run never reach disk. Writes are serialized through a
//! `tokio::sync::Mutex`; the file is opened in append mode.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::process::CommandOutput;

/// Replacement for masked values.
pub const MASK: &str = "****";

/// Shortest value that gets masked; shorter values would mangle ordinary text.
const MIN_SECRET_LEN: usize = 4;

/// Masks known secret values in arbitrary text.
#[derive(Default)]
pub struct Redactor {
    secrets: Vec<Zeroizing<String>>,
}

impl Redactor {
    pub fn new(values: impl IntoIterator<Item = Zeroizing<String>>) -> Self {
        let mut secrets: Vec<Zeroizing<String>> = values
            .into_iter()
            .filter(|v| v.chars().count() >= MIN_SECRET_LEN)
            .collect();
        // Longest first so a value containing another is masked whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.as_str().cmp(b.as_str())));
        secrets.dedup_by(|a, b| a.as_str() == b.as_str());
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}

struct Inner {
    file: tokio::fs::File,
    redactor: Redactor,
}

/// Append-only log of a single run.
pub struct RunLog {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl RunLog {
    /// Open (or create) the log file at `path` in append mode.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open run log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                file,
                redactor: Redactor::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Install the redactor used for every subsequent line.
    pub async fn set_redactor(&self, redactor: Redactor) {
        self.inner.lock().await.redactor = redactor;
    }

    /// Append one timestamped line. Multi-line text is split so every line
    /// carries its own timestamp.
    pub async fn line(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
        let mut buf = String::new();
        for line in text.lines() {
            buf.push_str(&format!("[{}] {}\n", ts, inner.redactor.redact(line)));
        }
        if buf.is_empty() {
            buf.push_str(&format!("[{}]\n", ts));
        }
        inner.file.write_all(buf.as_bytes()).await?;
        inner.file.flush().await?;
        Ok(())
    }

    /// Append the captured streams of a finished command.
    pub async fn command_output(&self, label: &str, output: &CommandOutput) -> Result<()> {
        for line in output.stdout.lines() {
            self.line(&format!("{} | {}", label, line)).await?;
        }
        for line in output.stderr.lines() {
            self.line(&format!("{} ! {}", label, line)).await?;
        }
        let status = match output.exit_code {
            Some(code) => code.to_string(),
            None => "signal".to_string(),
        };
        self.line(&format!(
            "{} exited: {} ({} ms)",
            label,
            status,
            output.duration.as_millis()
        ))
        .await
    }
}

/// Read a finished run's log.
pub fn read_log(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read run log {}", path.display()))
}
