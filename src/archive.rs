//! Artifact collection, fingerprinting and verification.
//!
//! Produced reports are located under the output tree, hashed with SHA-256,
//! and copied into the run's artifact directory with their relative paths
//! preserved. A fingerprint depends on file content only.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// An archived report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the output directory, `/`-separated.
    pub relative_path: String,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the file content.
    pub sha256: String,
}

/// Result of re-checking one archived artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    Ok,
    Modified,
    Missing,
}

impl std::fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyStatus::Ok => write!(f, "ok"),
            VerifyStatus::Modified => write!(f, "modified"),
            VerifyStatus::Missing => write!(f, "missing"),
        }
    }
}

/// Compute the SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Stream a file through SHA-256.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Every file under `root` whose extension matches `extension`
/// (case-insensitive), sorted. A missing `root` yields nothing.
pub fn collect(root: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !root.is_dir() {
        return Ok(found);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && has_extension(&path, extension) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension.trim_start_matches('.')))
        .unwrap_or(false)
}

/// Fingerprint every matching file under `output_dir` and copy it into
/// `dest`. A file that cannot be archived is skipped with a warning; the
/// remaining files are still archived.
pub fn archive_outputs(output_dir: &Path, extension: &str, dest: &Path) -> io::Result<Vec<Artifact>> {
    let files = collect(output_dir, extension)?;
    let mut artifacts = Vec::with_capacity(files.len());
    for file in files {
        match archive_one(output_dir, &file, dest) {
            Ok(artifact) => {
                debug!(path = %artifact.relative_path, sha256 = %artifact.sha256, "artifact archived");
                artifacts.push(artifact);
            }
            Err(e) => warn!(path = %file.display(), error = %e, "failed to archive file"),
        }
    }
    Ok(artifacts)
}

fn archive_one(output_dir: &Path, file: &Path, dest: &Path) -> io::Result<Artifact> {
    let relative = file
        .strip_prefix(output_dir)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let target = dest.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(file, &target)?;
    // Hash the archived copy: that is what verification checks later.
    let sha256 = fingerprint_file(&target)?;
    let size_bytes = fs::metadata(&target)?.len();
    Ok(Artifact {
        relative_path: relative_string(relative),
        size_bytes,
        sha256,
    })
}

fn relative_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Re-fingerprint `artifact` as archived under `dest`.
pub fn verify(dest: &Path, artifact: &Artifact) -> VerifyStatus {
    let path = dest.join(&artifact.relative_path);
    match fingerprint_file(&path) {
        Ok(hash) if hash == artifact.sha256 => VerifyStatus::Ok,
        Ok(_) => VerifyStatus::Modified,
        Err(_) => VerifyStatus::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_produces_known_hash() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_file_fingerprint_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        let data = vec![7u8; 200_000];
        fs::write(&path, &data).unwrap();
        assert_eq!(fingerprint_file(&path).unwrap(), sha256_hex(&data));
    }

    #[test]
    fn test_collect_filters_extension_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("output/reports");
        fs::create_dir_all(out.join("kw35")).unwrap();
        fs::write(out.join("weekly.pdf"), b"a").unwrap();
        fs::write(out.join("kw35/Customer_A.PDF"), b"b").unwrap();
        fs::write(out.join("notes.txt"), b"c").unwrap();

        let files = collect(&out, "pdf").unwrap();
        assert_eq!(files.len(), 2);
        assert!(collect(&dir.path().join("missing"), "pdf").unwrap().is_empty());
    }

    #[test]
    fn test_archive_copies_and_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let dest = dir.path().join("artifacts");
        fs::create_dir_all(out.join("sub")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(out.join("weekly.pdf"), b"%PDF-1.7 weekly").unwrap();
        fs::write(out.join("sub/other.pdf"), b"%PDF-1.7 other").unwrap();

        let artifacts = archive_outputs(&out, "pdf", &dest).unwrap();
        assert_eq!(artifacts.len(), 2);
        let weekly = artifacts
            .iter()
            .find(|a| a.relative_path == "weekly.pdf")
            .unwrap();
        assert_eq!(weekly.sha256, sha256_hex(b"%PDF-1.7 weekly"));
        assert_eq!(weekly.size_bytes, 15);
        assert!(dest.join("sub/other.pdf").exists());
        assert!(artifacts.iter().any(|a| a.relative_path == "sub/other.pdf"));
    }

    #[test]
    fn test_identical_bytes_give_identical_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("weekly.pdf"), b"same bytes").unwrap();

        let first = archive_outputs(&out, "pdf", &dir.path().join("a1")).unwrap();
        let second = archive_outputs(&out, "pdf", &dir.path().join("a2")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let dest = dir.path().join("artifacts");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("a.pdf"), b"original").unwrap();
        fs::write(out.join("b.pdf"), b"original b").unwrap();
        let artifacts = archive_outputs(&out, "pdf", &dest).unwrap();

        assert_eq!(verify(&dest, &artifacts[0]), VerifyStatus::Ok);
        fs::write(dest.join("a.pdf"), b"tampered").unwrap();
        fs::remove_file(dest.join("b.pdf")).unwrap();
        assert_eq!(verify(&dest, &artifacts[0]), VerifyStatus::Modified);
        assert_eq!(verify(&dest, &artifacts[1]), VerifyStatus::Missing);
    }
}
