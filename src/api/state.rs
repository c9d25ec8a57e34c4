use std::sync::Arc;

use crate::config::RunnerConfig;
use crate::scheduler::{RunGuard, RunHistory, Schedule};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RunnerConfig>,
    pub history: RunHistory,
    pub guard: RunGuard,
    pub schedule: Schedule,
}
