//! When runs happen: the cron trigger, the single-flight guard, and the
//! record of what ran.

pub mod cron;
pub mod engine;
pub mod guard;
pub mod history;

pub use self::cron::Schedule;
pub use self::engine::run_scheduler_loop;
pub use self::guard::RunGuard;
pub use self::history::{RunHistory, RunRecord, RunStatus, Trigger};
