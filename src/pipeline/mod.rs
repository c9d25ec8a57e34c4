//! The run pipeline: a fixed, linear sequence of steps.
//!
//! ```text
//! checkout -> prepare_environment -> materialize_secrets -> generate_report
//!          \______________ first fatal failure ______________/
//!                                   |
//!                                   v
//!                      archive_outputs (always) -> notify (on failure)
//! ```

pub mod runner;

use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

use crate::archive::Artifact;
use crate::error::ErrorClass;
use crate::scheduler::history::RunStatus;

pub use self::runner::JobRunner;

/// One stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Checkout,
    PrepareEnvironment,
    MaterializeSecrets,
    GenerateReport,
    ArchiveOutputs,
    Notify,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Checkout => "checkout",
            Step::PrepareEnvironment => "prepare_environment",
            Step::MaterializeSecrets => "materialize_secrets",
            Step::GenerateReport => "generate_report",
            Step::ArchiveOutputs => "archive_outputs",
            Step::Notify => "notify",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first fatal failure of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub step: Step,
    pub class: ErrorClass,
    pub message: String,
}

/// Outcome of one executed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub number: u64,
    pub run_id: Uuid,
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
    pub artifacts: Vec<Artifact>,
    /// Whether a failure notification was delivered.
    pub notified: bool,
    pub log_path: PathBuf,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}
