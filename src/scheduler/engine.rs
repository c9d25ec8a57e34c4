use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::cron::Schedule;
use super::history::Trigger;
use crate::pipeline::JobRunner;

/// Longest single sleep between clock checks. Keeps the loop honest
/// across suspend and wall-clock jumps.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Main scheduler execution loop.
/// Sleeps until each tick of `schedule` and starts a run in the background.
/// Returns when `shutdown` is cancelled; in-flight runs see the same token.
pub async fn run_scheduler_loop(
    runner: Arc<JobRunner>,
    schedule: Schedule,
    shutdown: CancellationToken,
) {
    info!(
        cron = schedule.expression(),
        tz = %schedule.timezone(),
        "Scheduler engine started"
    );

    loop {
        let Some(next) = schedule.next_after(Utc::now()) else {
            warn!("schedule has no future ticks, scheduler stopping");
            return;
        };
        info!(next = %next, "next scheduled run");

        loop {
            let remaining = (next.with_timezone(&Utc) - Utc::now())
                .to_std()
                .unwrap_or_default();
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(remaining.min(MAX_SLEEP)) => {}
                _ = shutdown.cancelled() => {
                    info!("Scheduler engine stopping");
                    return;
                }
            }
        }

        on_tick(&runner, next, &shutdown);
    }
}

/// Handle one tick: start a run, or drop the tick when one is active.
pub fn on_tick(
    runner: &Arc<JobRunner>,
    tick: impl Display,
    shutdown: &CancellationToken,
) -> Option<JoinHandle<()>> {
    let active = match runner.guard().try_acquire() {
        Ok(Some(active)) => active,
        Ok(None) => {
            warn!(tick = %tick, "tick suppressed: a run is already active");
            return None;
        }
        Err(e) => {
            error!(tick = %tick, error = %e, "failed to acquire run lock");
            return None;
        }
    };

    info!(tick = %tick, "Task due");
    let runner = runner.clone();
    let cancel = shutdown.child_token();
    Some(tokio::spawn(async move {
        let mode = runner.config().report.mode;
        match runner.execute(active, Trigger::Schedule, mode, cancel).await {
            Ok(summary) => info!(
                run = summary.number,
                status = %summary.status,
                "scheduled run finished"
            ),
            Err(e) => error!(error = %e, "scheduled run could not be recorded"),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::history::RunStatus;
    use crate::test_support::fixture;

    #[tokio::test]
    async fn test_tick_starts_scheduled_run() {
        let fx = fixture(|_| {});
        let handle = on_tick(&fx.runner, "monday", &CancellationToken::new()).unwrap();
        handle.await.unwrap();

        let runs = fx.runner.history().list(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].trigger, Trigger::Schedule);
        assert_eq!(runs[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn test_tick_is_suppressed_while_run_active() {
        let fx = fixture(|_| {});
        let held = fx.runner.guard().try_acquire().unwrap().unwrap();

        assert!(on_tick(&fx.runner, "monday", &CancellationToken::new()).is_none());
        // Suppressed ticks leave no trace in the history.
        assert!(fx.runner.history().list(10).await.unwrap().is_empty());

        drop(held);
        assert!(on_tick(&fx.runner, "monday", &CancellationToken::new()).is_some());
    }

    #[tokio::test]
    async fn test_loop_exits_on_shutdown() {
        let fx = fixture(|_| {});
        let schedule = Schedule::new("0 6 * * Mon", "Europe/Berlin").unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_scheduler_loop(
            fx.runner.clone(),
            schedule,
            shutdown.clone(),
        ));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
