//! Executes one run of the job from checkout to notification.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::{RunFailure, RunSummary, Step};
use crate::archive::{self, Artifact};
use crate::config::{CommandConfig, ReportMode, RunnerConfig};
use crate::error::StepError;
use crate::notify::{FailureContext, Notification, Notifier};
use crate::process::{self, CommandOutput, ProcessError};
use crate::runlog::RunLog;
use crate::scheduler::guard::{ActiveRun, RunGuard};
use crate::scheduler::history::{RunCompletion, RunHistory, RunRecord, RunStatus, Trigger};
use crate::secrets;
use crate::storage::Pool;
use crate::workspace::RunWorkspace;

/// Runs the job, one run at a time.
pub struct JobRunner {
    config: Arc<RunnerConfig>,
    history: RunHistory,
    notifier: Arc<dyn Notifier>,
    guard: RunGuard,
}

impl JobRunner {
    pub fn new(config: Arc<RunnerConfig>, pool: Pool, notifier: Arc<dyn Notifier>) -> Self {
        let guard = RunGuard::new(&config.storage.runs_dir);
        Self {
            config,
            history: RunHistory::new(pool),
            notifier,
            guard,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn guard(&self) -> &RunGuard {
        &self.guard
    }

    /// Where the log of run `number` is served.
    pub fn log_url(&self, number: u64) -> String {
        format!(
            "{}/api/v1/runs/{}/log",
            self.config.job.log_url_base.trim_end_matches('/'),
            number
        )
    }

    fn budget(&self) -> Duration {
        Duration::from_secs(self.config.limits.timeout_secs)
    }

    /// Start a run unless one is already active. `Ok(None)` means the
    /// trigger was suppressed.
    pub async fn run_once(
        &self,
        trigger: Trigger,
        mode: ReportMode,
        cancel: CancellationToken,
    ) -> Result<Option<RunSummary>> {
        let Some(active) = self.guard.try_acquire()? else {
            warn!(
                job = %self.config.job.name,
                trigger = trigger.as_str(),
                "run suppressed: another run is active"
            );
            return Ok(None);
        };
        self.execute(active, trigger, mode, cancel).await.map(Some)
    }

    /// Settle runs a crashed process left in `running`, under the run guard.
    /// `Ok(None)` means a run is active elsewhere and nothing was touched.
    pub async fn recover_interrupted(&self) -> Result<Option<usize>> {
        let Some(active) = self.guard.try_acquire()? else {
            warn!("run lock is held by another process; leaving running rows as they are");
            return Ok(None);
        };
        let recovered = self.history.mark_interrupted(&active).await?;
        drop(active);
        Ok(Some(recovered))
    }

    /// Execute a run while holding `active`.
    pub async fn execute(
        &self,
        active: ActiveRun,
        trigger: Trigger,
        mode: ReportMode,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let record = self
            .history
            .begin(&self.config.job.name, trigger, mode, &self.config.storage.runs_dir)
            .await?;
        let span = info_span!("run", job = %self.config.job.name, run = record.number);
        let summary = self
            .execute_recorded(record, mode, cancel)
            .instrument(span)
            .await;
        drop(active);
        summary
    }

    async fn execute_recorded(
        &self,
        record: RunRecord,
        mode: ReportMode,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        info!(trigger = record.trigger.as_str(), %mode, run_id = %record.run_id, "run started");

        let (mut workspace, log) = match self.open_workspace(record.number).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "run workspace unavailable");
                let failure = RunFailure {
                    step: Step::Checkout,
                    class: err.class(),
                    message: err.to_string(),
                };
                let notified = self.notify_failure(record.number, &failure).await;
                return self.finalize(record, Some(failure), Vec::new(), notified).await;
            }
        };

        note(
            &log,
            &format!(
                "run #{} of '{}' ({}) triggered by {}",
                record.number,
                self.config.job.name,
                mode,
                record.trigger.as_str()
            ),
        )
        .await;

        let deadline = Instant::now() + self.budget();
        let failure = match self
            .run_gated_steps(&record, &mut workspace, &log, mode, deadline, &cancel)
            .await
        {
            Ok(()) => None,
            Err((step, err)) => {
                let class = err.class();
                error!(step = %step, class = %class, error = %err, "run failed");
                note(&log, &format!("FAILED at {}: {} ({})", step, err, class)).await;
                Some(RunFailure {
                    step,
                    class,
                    message: err.to_string(),
                })
            }
        };

        // Archiving runs whatever happened above.
        enter(&log, Step::ArchiveOutputs).await;
        let artifacts = self.archive_step(&workspace, &log, record.number).await;

        if let Err(e) = workspace.teardown() {
            warn!(error = %e, "workspace teardown failed");
        }

        let notified = match &failure {
            Some(f) => {
                enter(&log, Step::Notify).await;
                let sent = self.notify_failure(record.number, f).await;
                note(
                    &log,
                    if sent {
                        "failure notification sent"
                    } else {
                        "failure notification could not be delivered"
                    },
                )
                .await;
                sent
            }
            None => false,
        };

        let status = status_of(failure.as_ref());
        note(&log, &format!("run finished: {}", status)).await;
        self.finalize(record, failure, artifacts, notified).await
    }

    async fn open_workspace(&self, number: u64) -> Result<(RunWorkspace, RunLog), StepError> {
        let workspace = RunWorkspace::create(&self.config.storage.runs_dir, number)?;
        let log = RunLog::open(workspace.log_path())
            .await
            .map_err(|e| StepError::Workspace(std::io::Error::other(e.to_string())))?;
        Ok((workspace, log))
    }

    /// Steps 1 to 4. The first failure stops the sequence.
    async fn run_gated_steps(
        &self,
        record: &RunRecord,
        workspace: &mut RunWorkspace,
        log: &RunLog,
        mode: ReportMode,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), (Step, StepError)> {
        let work = workspace.work_dir().to_path_buf();

        enter(log, Step::Checkout).await;
        let checkout = self.with_run_env(self.config.source.checkout_command(), record);
        self.command("checkout", &checkout, &work, log, deadline, cancel)
            .await
            .map_err(|e| (Step::Checkout, self.step_error(e, StepError::Checkout)))?;

        enter(log, Step::PrepareEnvironment).await;
        for (i, cmd) in self.config.environment.prepare.iter().enumerate() {
            let cmd = self.with_run_env(cmd.clone(), record);
            let label = format!("prepare[{}]", i);
            self.command(&label, &cmd, &work, log, deadline, cancel)
                .await
                .map_err(|e| {
                    let command = cmd.display();
                    (
                        Step::PrepareEnvironment,
                        self.step_error(e, |source| StepError::Prepare { command, source }),
                    )
                })?;
        }

        enter(log, Step::MaterializeSecrets).await;
        self.check_budget(deadline, cancel)
            .map_err(|e| (Step::MaterializeSecrets, e))?;
        let secret = secrets::materialize(&self.config.secret, workspace)
            .map_err(|e| (Step::MaterializeSecrets, e))?;
        log.set_redactor(secret.redactor()).await;
        note(
            log,
            &format!(
                "credential bundle written to {} ({} keys)",
                self.config.secret.target,
                secret.keys.len()
            ),
        )
        .await;

        enter(log, Step::GenerateReport).await;
        let report = self.with_run_env(self.config.report.command(mode), record);
        self.command("report", &report, &work, log, deadline, cancel)
            .await
            .map_err(|e| (Step::GenerateReport, self.step_error(e, StepError::Report)))?;
        info!("report generation succeeded");

        Ok(())
    }

    /// Run one external command against the remaining budget.
    async fn command(
        &self,
        label: &str,
        spec: &CommandConfig,
        cwd: &Path,
        log: &RunLog,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProcessError::TimedOut {
                limit: self.budget(),
                output: Box::default(),
            });
        }
        note(log, &format!("{} $ {}", label, spec.display())).await;
        match process::run_command(spec, cwd, remaining, cancel).await {
            Ok(output) => {
                record_output(log, label, &output).await;
                output.check().map(|_| ())
            }
            Err(err) => {
                // A killed command still leaves whatever it printed.
                if let Some(partial) = err.partial_output() {
                    record_output(log, label, partial).await;
                }
                Err(err)
            }
        }
    }

    fn check_budget(&self, deadline: Instant, cancel: &CancellationToken) -> Result<(), StepError> {
        if cancel.is_cancelled() {
            return Err(StepError::Aborted);
        }
        if Instant::now() >= deadline {
            return Err(StepError::TimedOut { limit: self.budget() });
        }
        Ok(())
    }

    /// Budget exhaustion and cancellation win over the step's own error.
    fn step_error(
        &self,
        err: ProcessError,
        wrap: impl FnOnce(ProcessError) -> StepError,
    ) -> StepError {
        match err {
            ProcessError::TimedOut { .. } => StepError::TimedOut { limit: self.budget() },
            ProcessError::Cancelled { .. } => StepError::Aborted,
            other => wrap(other),
        }
    }

    fn with_run_env(&self, mut cmd: CommandConfig, record: &RunRecord) -> CommandConfig {
        cmd.env
            .insert("REPORTRUNNER_JOB".to_string(), self.config.job.name.clone());
        cmd.env
            .insert("REPORTRUNNER_RUN_NUMBER".to_string(), record.number.to_string());
        cmd.env
            .insert("REPORTRUNNER_RUN_ID".to_string(), record.run_id.to_string());
        cmd
    }

    async fn archive_step(&self, workspace: &RunWorkspace, log: &RunLog, number: u64) -> Vec<Artifact> {
        let output_dir = workspace.work_dir().join(&self.config.report.output_dir);
        let artifacts = match archive::archive_outputs(
            &output_dir,
            &self.config.report.extension,
            workspace.artifacts_dir(),
        ) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!(error = %e, "archiving failed");
                note(log, &format!("archiving failed: {}", e)).await;
                return Vec::new();
            }
        };

        if artifacts.is_empty() {
            warn!(path = %output_dir.display(), "no artifacts found");
            note(log, "no artifacts found").await;
            return artifacts;
        }

        for a in &artifacts {
            info!(path = %a.relative_path, sha256 = %a.sha256, bytes = a.size_bytes, "generated file");
            note(
                log,
                &format!("artifact {} sha256={} ({} bytes)", a.relative_path, a.sha256, a.size_bytes),
            )
            .await;
        }
        if let Err(e) = self.history.record_artifacts(number, &artifacts).await {
            warn!(error = %e, "failed to record artifacts");
        }
        artifacts
    }

    async fn notify_failure(&self, number: u64, failure: &RunFailure) -> bool {
        let log_url = self.log_url(number);
        let ctx = FailureContext {
            job: &self.config.job.name,
            run_number: number,
            step: failure.step.as_str(),
            class: failure.class.as_str(),
            error: &failure.message,
            log_url: &log_url,
        };
        let notification = Notification::failure(&self.config.job.alert_address, &ctx);
        match self.notifier.send(&notification).await {
            Ok(()) => {
                info!(notifier = self.notifier.name(), to = %notification.to, "failure notification sent");
                true
            }
            Err(e) => {
                error!(notifier = self.notifier.name(), error = %e, "failure notification failed");
                false
            }
        }
    }

    async fn finalize(
        &self,
        record: RunRecord,
        failure: Option<RunFailure>,
        artifacts: Vec<Artifact>,
        notified: bool,
    ) -> Result<RunSummary> {
        let status = status_of(failure.as_ref());
        self.history
            .finish(
                record.number,
                &RunCompletion {
                    status,
                    failed_step: failure.as_ref().map(|f| f.step.as_str().to_string()),
                    error_class: failure.as_ref().map(|f| f.class),
                    error_message: failure.as_ref().map(|f| f.message.clone()),
                    notified,
                },
            )
            .await?;
        info!(status = %status, artifacts = artifacts.len(), "run finished");

        if let Err(e) = self
            .history
            .prune(&self.config.retention, &self.config.storage.runs_dir)
            .await
        {
            warn!(error = %e, "retention failed");
        }

        Ok(RunSummary {
            number: record.number,
            run_id: record.run_id,
            status,
            failure,
            artifacts,
            notified,
            log_path: record.log_path,
        })
    }
}

fn status_of(failure: Option<&RunFailure>) -> RunStatus {
    match failure {
        Some(f) => RunStatus::from_failure(f.class),
        None => RunStatus::Success,
    }
}

async fn enter(log: &RunLog, step: Step) {
    info!(step = %step, "step started");
    note(log, &format!("==> {}", step)).await;
}

async fn record_output(log: &RunLog, label: &str, output: &CommandOutput) {
    if let Err(e) = log.command_output(label, output).await {
        warn!(error = %e, "failed to write command output to run log");
    }
}

/// Best-effort log line; a broken log never fails the run.
async fn note(log: &RunLog, text: &str) {
    if let Err(e) = log.line(text).await {
        warn!(path = %log.path().display(), error = %e, "failed to write run log");
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("job", &self.config.job.name)
            .field("notifier", &self.notifier.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::test_support::fixture;

    #[tokio::test]
    async fn test_log_url_joins_base() {
        let fx = fixture(|cfg| cfg.job.log_url_base = "http://ci.local:8080/".to_string());
        assert_eq!(fx.runner.log_url(12), "http://ci.local:8080/api/v1/runs/12/log");
    }

    #[tokio::test]
    async fn test_successful_run_archives_without_notification() {
        let fx = fixture(|_| {});
        let summary = fx
            .runner
            .run_once(Trigger::Manual, ReportMode::Production, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.artifacts.len(), 1);
        assert!(!summary.notified);
        assert_eq!(fx.notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_prepare_stops_before_report() {
        let fx = fixture(|cfg| {
            cfg.job.name = "weekly-report".to_string();
            cfg.job.alert_address = "ops@example.com".to_string();
            cfg.environment.prepare = vec![
                CommandConfig::shell("true"),
                CommandConfig::shell("echo 'resolver conflict' >&2; exit 2"),
            ];
        });
        let summary = fx
            .runner
            .run_once(Trigger::Schedule, ReportMode::Production, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        let failure = summary.failure.unwrap();
        assert_eq!(failure.step, Step::PrepareEnvironment);
        assert_eq!(failure.class, ErrorClass::Environment);
        assert!(failure.message.contains("exited with status 2"));
        assert!(summary.artifacts.is_empty());

        let sent = fx.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ops@example.com");
        assert_eq!(sent[0].subject, "FAILED: Job 'weekly-report' [#1]");
        assert!(sent[0].body.contains("Step:   prepare_environment"));
        assert!(sent[0].body.contains("Class:  environment"));
        assert!(sent[0].body.contains("exited with status 2"));
        assert!(sent[0].body.contains(&fx.runner.log_url(1)));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_and_notifies() {
        let fx = fixture(|cfg| cfg.report.args = vec!["-c".into(), "sleep 30".into()]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let summary = fx
            .runner
            .run_once(Trigger::Manual, ReportMode::Production, cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, RunStatus::Aborted);
        let sent = fx.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("Step:   generate_report"));
        assert!(sent[0].body.contains("Class:  aborted"));
    }

    #[tokio::test]
    async fn test_timed_out_report_leaves_its_output_in_the_log() {
        let fx = fixture(|cfg| {
            cfg.limits.timeout_secs = 1;
            cfg.report.args = vec!["-c".into(), "echo 'rendering page 1'; sleep 30".into()];
        });
        let summary = fx
            .runner
            .run_once(Trigger::Manual, ReportMode::Production, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, RunStatus::TimedOut);
        let log = crate::runlog::read_log(&summary.log_path).unwrap();
        assert!(log.contains("report | rendering page 1"));
        assert!(log.contains("report exited: signal"));
    }

    #[tokio::test]
    async fn test_recovery_leaves_running_rows_while_lock_is_held() {
        let fx = fixture(|_| {});
        let runs_dir = &fx.config.storage.runs_dir;
        let live = fx
            .runner
            .history()
            .begin("weekly", Trigger::Schedule, ReportMode::Production, runs_dir)
            .await
            .unwrap();

        // Another process is mid-run on the same runs directory.
        let other = RunGuard::new(runs_dir).try_acquire().unwrap().unwrap();
        assert_eq!(fx.runner.recover_interrupted().await.unwrap(), None);
        let stored = fx.runner.history().get(live.number).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);

        drop(other);
        assert_eq!(fx.runner.recover_interrupted().await.unwrap(), Some(1));
        let stored = fx.runner.history().get(live.number).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_change_status() {
        let fx = fixture(|cfg| cfg.report.args = vec!["-c".into(), "exit 1".into()]);
        fx.notifier.fail_deliveries();
        let summary = fx
            .runner
            .run_once(Trigger::Manual, ReportMode::Production, CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert!(!summary.notified);
        assert_eq!(fx.notifier.count(), 1);
    }
}
