//! reportrunner -- scheduled runner for a report-producing job.
//!
//! Each run checks out the job's source into an isolated workspace,
//! prepares its environment, materializes credentials, runs the report
//! program, then fingerprints and archives what it produced. Failures are
//! classified and reported once to an alerting address.

pub mod api;
pub mod archive;
pub mod config;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod process;
pub mod runlog;
pub mod scheduler;
pub mod secrets;
pub mod storage;
pub mod workspace;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::pipeline::JobRunner;
use crate::scheduler::Schedule;

/// Open storage and build the runner with its configured notifier.
pub fn build_runner(config: Arc<RunnerConfig>) -> Result<Arc<JobRunner>> {
    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;
    let notifier = notify::from_config(&config.notify).context("Invalid [notify] section")?;
    Ok(Arc::new(JobRunner::new(config, pool, notifier)))
}

/// Start the daemon: scheduler and read-only API server. Returns after
/// Ctrl-C, once in-flight runs have been told to stop.
pub async fn serve(config: RunnerConfig) -> Result<()> {
    config.validate()?;
    let config = Arc::new(config);

    // 1. Storage and runner
    let runner = build_runner(config.clone())?;
    runner.recover_interrupted().await?;

    // 2. Scheduler engine (background task)
    let schedule = Schedule::from_config(&config.schedule)?;
    let shutdown = CancellationToken::new();
    let engine = if config.schedule.enabled {
        Some(tokio::spawn(scheduler::run_scheduler_loop(
            runner.clone(),
            schedule.clone(),
            shutdown.clone(),
        )))
    } else {
        tracing::warn!("schedule disabled, only manual runs will happen");
        None
    };

    // 3. API server
    let state = api::state::AppState {
        config: config.clone(),
        history: runner.history().clone(),
        guard: runner.guard().clone(),
        schedule,
    };
    let app = api::router(state);
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;

    tracing::info!(%addr, job = %config.job.name, "reportrunner listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
            stop.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(engine) = engine {
        if let Err(e) = engine.await {
            tracing::warn!(error = %e, "scheduler task ended abnormally");
        }
    }
    // An in-flight run holds the guard until it has recorded its outcome.
    while runner.guard().is_active() {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    Ok(())
}
