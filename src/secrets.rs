//! Credential bundle materialization.
//!
//! The stored bundle is copied into the run's work directory as the dotenv
//! file the report program loads. Its bytes live in zeroizing buffers, it is
//! validated without echoing any value, and the written file is readable by
//! the owner only.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::info;
use zeroize::Zeroizing;

use crate::config::SecretConfig;
use crate::error::StepError;
use crate::runlog::Redactor;
use crate::workspace::RunWorkspace;

/// A credential bundle that has been placed into a run's work directory.
pub struct MaterializedSecret {
    pub path: PathBuf,
    pub keys: Vec<String>,
    values: Vec<Zeroizing<String>>,
}

impl MaterializedSecret {
    /// Redactor masking every value of the bundle.
    pub fn redactor(&self) -> Redactor {
        Redactor::new(self.values.iter().cloned())
    }
}

impl std::fmt::Debug for MaterializedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedSecret")
            .field("path", &self.path)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

/// Copy the credential bundle into `workspace` and register it for teardown.
pub fn materialize(
    config: &SecretConfig,
    workspace: &mut RunWorkspace,
) -> Result<MaterializedSecret, StepError> {
    let bytes = read_bundle(&config.source)?;
    let entries = parse_bundle(&config.source, &bytes)?;

    let missing: Vec<String> = config
        .required_keys
        .iter()
        .filter(|k| !entries.iter().any(|(key, _)| key == *k))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(StepError::SecretKeysMissing { keys: missing });
    }

    let target = workspace.work_dir().join(&config.target);
    // Registered before writing so a partial write is still cleaned up.
    workspace.register_secret(target.clone());
    write_private(&target, &bytes)?;

    info!(
        path = %target.display(),
        keys = entries.len(),
        "credential bundle materialized"
    );

    let (keys, values) = entries.into_iter().unzip();
    Ok(MaterializedSecret {
        path: target,
        keys,
        values,
    })
}

fn read_bundle(path: &Path) -> Result<Zeroizing<Vec<u8>>, StepError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Zeroizing::new(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StepError::SecretMissing {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(StepError::SecretUnreadable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parse dotenv content. Errors report a line number, never the line.
fn parse_bundle(
    path: &Path,
    bytes: &[u8],
) -> Result<Vec<(String, Zeroizing<String>)>, StepError> {
    let mut entries = Vec::new();
    for item in dotenvy::from_read_iter(bytes) {
        match item {
            Ok((key, value)) => entries.push((key, Zeroizing::new(value))),
            Err(dotenvy::Error::LineParse(bad, _)) => {
                let bad = Zeroizing::new(bad);
                let text = Zeroizing::new(String::from_utf8_lossy(bytes).into_owned());
                let line = text
                    .lines()
                    .position(|l| !bad.trim().is_empty() && l.contains(bad.trim()))
                    .map(|i| i + 1)
                    .unwrap_or(0);
                return Err(StepError::SecretInvalid {
                    path: path.to_path_buf(),
                    line,
                });
            }
            Err(dotenvy::Error::Io(source)) => {
                return Err(StepError::SecretUnreadable {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(_) => {
                return Err(StepError::SecretInvalid {
                    path: path.to_path_buf(),
                    line: 0,
                })
            }
        }
    }
    Ok(entries)
}

fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
