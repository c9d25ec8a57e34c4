//! Fixtures shared by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::{CommandConfig, RunnerConfig};
use crate::notify::{Notification, Notifier, NotifyError};
use crate::pipeline::JobRunner;
use crate::storage::open_pool;

pub const SECRET_VALUE: &str = "s3cr3t-token-value";

/// Keeps every notification instead of delivering it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Record attempts but report every delivery as failed.
    pub fn fail_deliveries(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Config("delivery refused".to_string()));
        }
        Ok(())
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub config: Arc<RunnerConfig>,
    pub runner: Arc<JobRunner>,
    pub notifier: Arc<RecordingNotifier>,
}

/// A runner whose job is a handful of `sh` scripts inside a temp dir.
pub fn fixture(customize: impl FnOnce(&mut RunnerConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let secret = dir.path().join("weekly.env");
    std::fs::write(
        &secret,
        format!("API_TOKEN={}\nDB_NAME=reports\n", SECRET_VALUE),
    )
    .unwrap();

    let mut config = RunnerConfig::default();
    config.storage.db_path = dir.path().join("runner.db");
    config.storage.runs_dir = dir.path().join("runs");
    config.source.checkout = Some(CommandConfig::shell("mkdir -p app && echo cloned"));
    config.environment.prepare = vec![CommandConfig::shell("echo dependencies ready")];
    config.secret.source = secret;
    config.secret.required_keys = vec!["API_TOKEN".to_string(), "DB_NAME".to_string()];
    config.report.program = "sh".to_string();
    config.report.args = vec![
        "-c".to_string(),
        "mkdir -p output/reports && echo \"%PDF weekly $REPORTRUNNER_RUN_NUMBER\" > output/reports/weekly.pdf"
            .to_string(),
    ];
    config.limits.timeout_secs = 30;
    customize(&mut config);

    let config = Arc::new(config);
    let pool = open_pool(&config.storage.db_path).unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let runner = Arc::new(JobRunner::new(config.clone(), pool, notifier.clone()));
    Fixture {
        dir,
        config,
        runner,
        notifier,
    }
}
