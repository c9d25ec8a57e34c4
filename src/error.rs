//! Failure taxonomy for pipeline steps.
//!
//! Every fatal step failure maps onto one [`ErrorClass`]; the class decides
//! the run's final status and is quoted in the failure notification.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessError;

/// Coarse classification of a fatal run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Checkout or dependency installation failed.
    Environment,
    /// The credential bundle was missing or invalid.
    Configuration,
    /// The report program exited unsuccessfully.
    Execution,
    /// The wall-clock budget was exhausted.
    Timeout,
    /// An operator cancelled the run.
    Aborted,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Environment => "environment",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Execution => "execution",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "environment" => Some(ErrorClass::Environment),
            "configuration" => Some(ErrorClass::Configuration),
            "execution" => Some(ErrorClass::Execution),
            "timeout" => Some(ErrorClass::Timeout),
            "aborted" => Some(ErrorClass::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal failure of one of the steps that gate the run's outcome.
///
/// Messages never include credential values, only paths and key names.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("checkout failed: {0}")]
    Checkout(#[source] ProcessError),

    #[error("dependency command `{command}` failed: {source}")]
    Prepare {
        command: String,
        #[source]
        source: ProcessError,
    },

    #[error("credential bundle not found at {}", path.display())]
    SecretMissing { path: PathBuf },

    #[error("credential bundle at {} is unreadable: {source}", path.display())]
    SecretUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential bundle at {} is not a valid dotenv file (line {line})", path.display())]
    SecretInvalid { path: PathBuf, line: usize },

    #[error("credential bundle is missing required keys: {}", keys.join(", "))]
    SecretKeysMissing { keys: Vec<String> },

    #[error("report generation failed: {0}")]
    Report(#[source] ProcessError),

    #[error("run exceeded its {}s wall-clock limit", limit.as_secs())]
    TimedOut { limit: Duration },

    #[error("run aborted by operator")]
    Aborted,

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl StepError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::Checkout(_)
            | StepError::Prepare { .. }
            | StepError::Workspace(_)
            | StepError::Report(ProcessError::Spawn { .. }) => ErrorClass::Environment,
            StepError::SecretMissing { .. }
            | StepError::SecretUnreadable { .. }
            | StepError::SecretInvalid { .. }
            | StepError::SecretKeysMissing { .. } => ErrorClass::Configuration,
            StepError::Report(ProcessError::TimedOut { .. }) | StepError::TimedOut { .. } => {
                ErrorClass::Timeout
            }
            StepError::Report(ProcessError::Cancelled { .. }) | StepError::Aborted => ErrorClass::Aborted,
            StepError::Report(_) => ErrorClass::Execution,
        }
    }
}
