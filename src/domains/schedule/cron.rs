use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::errors::{DomainError, DomainResult};

/// Parsed cron expression for next-run computation.
///
/// Customers write standard 5-field cron (minute hour day-of-month month
/// day-of-week); the `cron` crate wants a seconds column, so 5-field
/// expressions get `0 ` prepended before parsing.
pub struct CronSchedule {
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> DomainResult<Self> {
        let normalized = normalize(expr);
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| DomainError::InvalidCron {
                expr: expr.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { schedule })
    }

    pub fn validate(expr: &str) -> DomainResult<()> {
        Self::parse(expr).map(|_| ())
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

fn normalize(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}
