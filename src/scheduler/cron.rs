use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use crate::config::ScheduleConfig;

/// Parse a cron expression. Five-field expressions get an implied `0`
/// seconds field; six- and seven-field expressions pass through.
pub fn parse_expression(expr: &str) -> Result<CronSchedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        n => anyhow::bail!(
            "Invalid cron expression '{}': expected 5 to 7 fields, found {}",
            expr,
            n
        ),
    };
    CronSchedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))
}

/// The job's trigger: a cron expression evaluated in a named timezone.
#[derive(Debug, Clone)]
pub struct Schedule {
    expr: String,
    tz: Tz,
    cron: CronSchedule,
}

impl Schedule {
    pub fn new(expr: &str, timezone: &str) -> Result<Self> {
        let cron = parse_expression(expr)?;
        let tz = Tz::from_str(timezone)
            .map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {}", timezone, e))?;
        Ok(Self {
            expr: expr.to_string(),
            tz,
            cron,
        })
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        Self::new(&config.cron, &config.timezone).context("Invalid [schedule] section")
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// First tick strictly after `instant`, in the schedule's timezone.
    pub fn next_after(&self, instant: DateTime<Utc>) -> Option<DateTime<Tz>> {
        self.cron.after(&instant.with_timezone(&self.tz)).next()
    }

    /// The next `count` ticks after `instant`.
    pub fn upcoming(&self, instant: DateTime<Utc>, count: usize) -> Vec<DateTime<Tz>> {
        self.cron
            .after(&instant.with_timezone(&self.tz))
            .take(count)
            .collect()
    }

    /// All ticks within `hours` of `instant`. A dry-run preview, not the
    /// execution loop.
    pub fn preview(&self, instant: DateTime<Utc>, hours: u64) -> Vec<DateTime<Tz>> {
        let end = instant + Duration::hours(hours as i64);
        self.cron
            .after(&instant.with_timezone(&self.tz))
            .take_while(|t| t.with_timezone(&Utc) <= end)
            .collect()
    }
}
