//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use reportrunner::config::{CommandConfig, RunnerConfig};
use reportrunner::notify::{Notification, Notifier, NotifyError};
use reportrunner::pipeline::JobRunner;
use reportrunner::storage::open_pool;

pub const TOKEN: &str = "tok-9f2c1a77e5";
pub const PASSWORD: &str = "hunter2-but-longer";

/// Collects notifications in memory.
#[derive(Default)]
pub struct Outbox {
    sent: Mutex<Vec<Notification>>,
}

impl Outbox {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for Outbox {
    fn name(&self) -> &'static str {
        "outbox"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub runner: Arc<JobRunner>,
    pub outbox: Arc<Outbox>,
}

impl Harness {
    pub fn runs_dir(&self) -> &Path {
        &self.runner.config().storage.runs_dir
    }

    pub fn marker(&self) -> std::path::PathBuf {
        self.dir.path().join("report-invoked")
    }
}

/// Write the credential bundle used by [`config`].
pub fn write_bundle(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("credentials.env");
    std::fs::write(&path, contents).unwrap();
    path
}

/// The weekly job, with `sh` standing in for git, pip and the report
/// program. `report` is the report script; it runs in the work directory.
pub fn config(dir: &Path, report: &str) -> RunnerConfig {
    let mut cfg = RunnerConfig::default();
    cfg.job.name = "weekly-report".to_string();
    cfg.job.alert_address = "ops@example.com".to_string();
    cfg.storage.db_path = dir.join("state").join("runner.db");
    cfg.storage.runs_dir = dir.join("state").join("runs");
    cfg.source.checkout = Some(CommandConfig::shell(
        "mkdir -p app && echo 'requests==2.32' > requirements.txt",
    ));
    cfg.environment.prepare = vec![CommandConfig::shell("test -f requirements.txt")];
    cfg.secret.source = write_bundle(
        dir,
        &format!(
            "ODOO_BASE_URL=https://erp.example.com\nODOO_DB=erp_main\nODOO_USERNAME=reporter\nODOO_PASSWORD={}\nEMAIL_SMTP_HOST=smtp.example.com\nAPI_TOKEN={}\n",
            PASSWORD, TOKEN
        ),
    );
    cfg.report.program = "sh".to_string();
    cfg.report.args = vec![
        "-c".to_string(),
        format!("touch '{}'; {}", dir.join("report-invoked").display(), report),
    ];
    cfg.limits.timeout_secs = 30;
    cfg
}

pub fn harness(cfg: RunnerConfig, dir: TempDir) -> Harness {
    let cfg = Arc::new(cfg);
    let pool = open_pool(&cfg.storage.db_path).unwrap();
    let outbox = Arc::new(Outbox::default());
    let runner = Arc::new(JobRunner::new(cfg, pool, outbox.clone()));
    Harness {
        dir,
        runner,
        outbox,
    }
}

/// Writes `output/reports/weekly.pdf`.
pub const WEEKLY_PDF: &str =
    "mkdir -p output/reports && echo '%PDF-1.7 weekly numbers' > output/reports/weekly.pdf";
