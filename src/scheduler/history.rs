//! Execution history of runs and their artifacts.
//!
//! Run numbers are allocated here (monotonic, starting at 1) and retention
//! is enforced here, deleting the pruned runs' directories along with their
//! rows.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::Artifact;
use crate::config::{ReportMode, RetentionConfig};
use crate::error::ErrorClass;
use crate::scheduler::guard::ActiveRun;
use crate::storage::Pool;
use crate::workspace;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    TimedOut,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Aborted => "aborted",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => RunStatus::Running,
            "success" => RunStatus::Success,
            "timed_out" => RunStatus::TimedOut,
            "aborted" => RunStatus::Aborted,
            _ => RunStatus::Failed,
        }
    }

    /// Status of a run that failed with `class`.
    pub fn from_failure(class: ErrorClass) -> Self {
        match class {
            ErrorClass::Timeout => RunStatus::TimedOut,
            ErrorClass::Aborted => RunStatus::Aborted,
            _ => RunStatus::Failed,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Schedule,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "schedule" => Trigger::Schedule,
            _ => Trigger::Manual,
        }
    }
}

/// A persisted run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub number: u64,
    pub run_id: Uuid,
    pub job: String,
    pub trigger: Trigger,
    pub mode: String,
    pub status: RunStatus,
    pub failed_step: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log_path: PathBuf,
    pub notified: bool,
}

/// How a run ended, as recorded by [`RunHistory::finish`].
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub failed_step: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub notified: bool,
}

const RUN_COLUMNS: &str = "number, run_id, job, trigger_kind, mode, status, failed_step, \
     error_class, error_message, started_at, finished_at, log_path, notified";

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_id: String = row.get(1)?;
    let trigger: String = row.get(3)?;
    let status: String = row.get(5)?;
    let error_class: Option<String> = row.get(7)?;
    let started_at: String = row.get(9)?;
    let finished_at: Option<String> = row.get(10)?;
    let log_path: String = row.get(11)?;
    Ok(RunRecord {
        number: row.get::<_, i64>(0)? as u64,
        run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
        job: row.get(2)?,
        trigger: Trigger::parse(&trigger),
        mode: row.get(4)?,
        status: RunStatus::parse(&status),
        failed_step: row.get(6)?,
        error_class: error_class.as_deref().and_then(ErrorClass::parse),
        error_message: row.get(8)?,
        started_at: parse_time(&started_at),
        finished_at: finished_at.as_deref().map(parse_time),
        log_path: PathBuf::from(log_path),
        notified: row.get::<_, i64>(12)? != 0,
    })
}

/// Run and artifact records backed by SQLite.
#[derive(Clone)]
pub struct RunHistory {
    pool: Pool,
}

impl RunHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Allocate the next run number and record the run as running.
    pub async fn begin(
        &self,
        job: &str,
        trigger: Trigger,
        mode: ReportMode,
        runs_dir: &Path,
    ) -> Result<RunRecord> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let number: i64 =
            tx.query_row("SELECT COALESCE(MAX(number), 0) + 1 FROM runs", [], |row| {
                row.get(0)
            })?;
        let number = number as u64;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let log_path = workspace::run_dir(runs_dir, number).join("run.log");
        tx.execute(
            "INSERT INTO runs (number, run_id, job, trigger_kind, mode, status, started_at, log_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                number as i64,
                run_id.to_string(),
                job,
                trigger.as_str(),
                mode.to_string(),
                RunStatus::Running.as_str(),
                started_at.to_rfc3339(),
                log_path.to_string_lossy().into_owned(),
            ],
        )
        .context("Failed to insert run")?;
        tx.commit()?;

        Ok(RunRecord {
            number,
            run_id,
            job: job.to_string(),
            trigger,
            mode: mode.to_string(),
            status: RunStatus::Running,
            failed_step: None,
            error_class: None,
            error_message: None,
            started_at,
            finished_at: None,
            log_path,
            notified: false,
        })
    }

    /// Record the outcome of run `number`.
    pub async fn finish(&self, number: u64, completion: &RunCompletion) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, failed_step = ?2, error_class = ?3, error_message = ?4,
                 finished_at = ?5, notified = ?6
             WHERE number = ?7",
            params![
                completion.status.as_str(),
                completion.failed_step,
                completion.error_class.map(|c| c.as_str()),
                completion.error_message,
                Utc::now().to_rfc3339(),
                completion.notified as i64,
                number as i64,
            ],
        )?;
        if changed == 0 {
            anyhow::bail!("Run #{} not found", number);
        }
        Ok(())
    }

    pub async fn record_artifacts(&self, number: u64, artifacts: &[Artifact]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO artifacts (run_number, relative_path, size_bytes, sha256)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for a in artifacts {
                stmt.execute(params![
                    number as i64,
                    a.relative_path,
                    a.size_bytes as i64,
                    a.sha256
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY number DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map([limit as i64], run_from_row)?;
        let mut runs = Vec::new();
        for r in rows {
            runs.push(r?);
        }
        Ok(runs)
    }

    pub async fn get(&self, number: u64) -> Result<Option<RunRecord>> {
        let conn = self.pool.get()?;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE number = ?1", RUN_COLUMNS),
                [number as i64],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub async fn artifacts(&self, number: u64) -> Result<Vec<Artifact>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT relative_path, size_bytes, sha256 FROM artifacts
             WHERE run_number = ?1 ORDER BY relative_path",
        )?;
        let rows = stmt.query_map([number as i64], |row| {
            Ok(Artifact {
                relative_path: row.get(0)?,
                size_bytes: row.get::<_, i64>(1)? as u64,
                sha256: row.get(2)?,
            })
        })?;
        let mut artifacts = Vec::new();
        for r in rows {
            artifacts.push(r?);
        }
        Ok(artifacts)
    }

    /// Mark runs left in `running` by a crashed process as aborted.
    ///
    /// Requires the run guard: while another process holds it, its
    /// `running` row is live and must stay untouched.
    pub async fn mark_interrupted(&self, _held: &ActiveRun) -> Result<usize> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'aborted', error_class = 'aborted',
                 error_message = 'runner stopped before the run finished', finished_at = ?1
             WHERE status = 'running'",
            [Utc::now().to_rfc3339()],
        )?;
        if changed > 0 {
            warn!(count = changed, "marked interrupted runs as aborted");
        }
        Ok(changed)
    }

    /// Discard finished runs beyond the retention policy, newest kept first.
    /// Returns the pruned run numbers.
    pub async fn prune(&self, policy: &RetentionConfig, runs_dir: &Path) -> Result<Vec<u64>> {
        let finished: Vec<(u64, DateTime<Utc>)> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT number, started_at FROM runs WHERE status != 'running' ORDER BY number DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    parse_time(&row.get::<_, String>(1)?),
                ))
            })?;
            let finished = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            finished
        };

        let cutoff = policy
            .max_age_days
            .map(|days| Utc::now() - chrono::Duration::days(days as i64));

        let doomed: Vec<u64> = finished
            .iter()
            .enumerate()
            .filter(|(i, (_, started))| {
                *i >= policy.max_runs as usize || cutoff.is_some_and(|c| *started < c)
            })
            .map(|(_, (number, _))| *number)
            .collect();

        if doomed.is_empty() {
            return Ok(doomed);
        }

        {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction()?;
            for number in &doomed {
                tx.execute(
                    "DELETE FROM artifacts WHERE run_number = ?1",
                    [*number as i64],
                )?;
                tx.execute("DELETE FROM runs WHERE number = ?1", [*number as i64])?;
            }
            tx.commit()?;
        }

        for number in &doomed {
            let dir = workspace::run_dir(runs_dir, *number);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(run = number, path = %dir.display(), error = %e, "failed to remove pruned run directory");
                }
            }
        }
        info!(pruned = doomed.len(), "retention applied");
        Ok(doomed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::guard::RunGuard;
    use crate::storage::open_pool;

    fn history(dir: &Path) -> RunHistory {
        RunHistory::new(open_pool(&dir.join("runner.db")).unwrap())
    }

    fn success() -> RunCompletion {
        RunCompletion {
            status: RunStatus::Success,
            failed_step: None,
            error_class: None,
            error_message: None,
            notified: false,
        }
    }

    #[tokio::test]
    async fn test_run_numbers_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let h = history(dir.path());
        let runs = dir.path().join("runs");
        let a = h.begin("job", Trigger::Schedule, ReportMode::Production, &runs).await.unwrap();
        let b = h.begin("job", Trigger::Manual, ReportMode::Development, &runs).await.unwrap();
        assert_eq!((a.number, b.number), (1, 2));
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(b.log_path, runs.join("2").join("run.log"));

        let stored = h.get(2).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(stored.trigger, Trigger::Manual);
        assert_eq!(stored.mode, "development");
    }

    #[tokio::test]
    async fn test_finish_and_artifacts_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let h = history(dir.path());
        let run = h
            .begin("job", Trigger::Schedule, ReportMode::Production, dir.path())
            .await
            .unwrap();
        h.finish(
            run.number,
            &RunCompletion {
                status: RunStatus::Failed,
                failed_step: Some("generate_report".into()),
                error_class: Some(ErrorClass::Execution),
                error_message: Some("exited with status 1".into()),
                notified: true,
            },
        )
        .await
        .unwrap();
        let artifacts = vec![Artifact {
            relative_path: "weekly.pdf".into(),
            size_bytes: 10,
            sha256: "ab".repeat(32),
        }];
        h.record_artifacts(run.number, &artifacts).await.unwrap();

        let stored = h.get(run.number).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error_class, Some(ErrorClass::Execution));
        assert!(stored.notified);
        assert!(stored.finished_at.is_some());
        assert_eq!(h.artifacts(run.number).await.unwrap(), artifacts);
        assert!(h.finish(99, &success()).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent_runs() {
        let dir = tempfile::tempdir().unwrap();
        let h = history(dir.path());
        let runs = dir.path().join("runs");
        for _ in 0..5 {
            let run = h
                .begin("job", Trigger::Schedule, ReportMode::Production, &runs)
                .await
                .unwrap();
            std::fs::create_dir_all(workspace::run_dir(&runs, run.number)).unwrap();
            h.finish(run.number, &success()).await.unwrap();
        }
        // An active run is never pruned.
        let active = h
            .begin("job", Trigger::Manual, ReportMode::Production, &runs)
            .await
            .unwrap();

        let policy = RetentionConfig {
            max_runs: 2,
            max_age_days: None,
        };
        let pruned = h.prune(&policy, &runs).await.unwrap();
        assert_eq!(pruned, vec![3, 2, 1]);
        assert!(!workspace::run_dir(&runs, 1).exists());
        assert!(workspace::run_dir(&runs, 5).exists());

        let remaining: Vec<u64> = h.list(10).await.unwrap().iter().map(|r| r.number).collect();
        assert_eq!(remaining, vec![active.number, 5, 4]);

        // Numbers keep increasing after pruning.
        let next = h
            .begin("job", Trigger::Manual, ReportMode::Production, &runs)
            .await
            .unwrap();
        assert_eq!(next.number, 7);
    }

    #[tokio::test]
    async fn test_prune_discards_runs_past_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let h = history(dir.path());
        let runs = dir.path().join("runs");
        for _ in 0..5 {
            let run = h
                .begin("job", Trigger::Schedule, ReportMode::Production, &runs)
                .await
                .unwrap();
            h.finish(run.number, &success()).await.unwrap();
        }
        // Run 4 started long ago; the rest are fresh.
        let old = (Utc::now() - chrono::Duration::days(40)).to_rfc3339();
        h.pool
            .get()
            .unwrap()
            .execute(
                "UPDATE runs SET started_at = ?1 WHERE number = 4",
                [old],
            )
            .unwrap();

        let policy = RetentionConfig {
            max_runs: 3,
            max_age_days: Some(30),
        };
        let pruned = h.prune(&policy, &runs).await.unwrap();
        // 4 by age, 2 and 1 by count.
        assert_eq!(pruned, vec![4, 2, 1]);
        let remaining: Vec<u64> = h.list(10).await.unwrap().iter().map(|r| r.number).collect();
        assert_eq!(remaining, vec![5, 3]);
    }

    #[tokio::test]
    async fn test_mark_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let h = history(dir.path());
        let run = h
            .begin("job", Trigger::Schedule, ReportMode::Production, dir.path())
            .await
            .unwrap();
        let held = RunGuard::new(dir.path()).try_acquire().unwrap().unwrap();
        assert_eq!(h.mark_interrupted(&held).await.unwrap(), 1);
        let stored = h.get(run.number).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Aborted);
        assert_eq!(h.mark_interrupted(&held).await.unwrap(), 0);
    }
}
