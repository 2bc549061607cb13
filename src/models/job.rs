//! Description of a recurring maintenance job.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::UploadError;

// Ten years; keeps `next_run` arithmetic in range.
const MAX_INTERVAL_SECS: u64 = 315_360_000;

/// When a recurring job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Cadence {
    /// Fixed gap between runs.
    Every { secs: u64 },
    /// Cron expression evaluated in UTC, stored with a seconds field.
    Cron { expression: String },
}

impl Cadence {
    pub fn every(secs: u64) -> Self {
        Cadence::Every {
            secs: secs.clamp(1, MAX_INTERVAL_SECS),
        }
    }

    /// Parse a cron expression. A five-field expression (`0 0 * * *`) runs
    /// at second zero.
    pub fn cron(expression: &str) -> Result<Self, UploadError> {
        let trimmed = expression.trim();
        let expression = if trimmed.split_whitespace().count() == 5 {
            format!("0 {}", trimmed)
        } else {
            trimmed.to_string()
        };
        cron::Schedule::from_str(&expression).map_err(|err| {
            UploadError::InvalidParams(format!("cron expression `{}`: {}", trimmed, err))
        })?;
        Ok(Cadence::Cron { expression })
    }

    /// First run strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every { secs } => {
                after.checked_add_signed(Duration::seconds((*secs).min(MAX_INTERVAL_SECS) as i64))
            }
            Cadence::Cron { expression } => cron::Schedule::from_str(expression)
                .ok()?
                .after(&after)
                .next(),
        }
    }
}

/// A recurring job, described explicitly rather than hidden in a timer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub name: String,
    pub cadence: Cadence,
    /// Stopped jobs keep their cadence but never come due.
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub running: bool,
}

impl ScheduledJob {
    pub fn new(name: impl Into<String>, cadence: Cadence, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            next_run: cadence.next_after(now),
            cadence,
            enabled: true,
            last_run: None,
            running: false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|next| now >= next)
    }

    /// How long until the next run, or `None` when nothing is scheduled.
    pub fn wait_from(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        if !self.enabled {
            return None;
        }
        self.next_run
            .map(|next| (next - now).to_std().unwrap_or(std::time::Duration::ZERO))
    }

    /// Record a completed run that started at `started`.
    pub fn mark_ran(&mut self, started: DateTime<Utc>) {
        self.last_run = Some(started);
        if self.enabled {
            self.next_run = self.cadence.next_after(started);
        }
    }

    /// Enable the job. Starting a running job without a new cadence leaves
    /// its schedule alone.
    pub fn start(&mut self, cadence: Option<Cadence>, now: DateTime<Utc>) {
        if self.enabled && cadence.is_none() {
            return;
        }
        if let Some(cadence) = cadence {
            self.cadence = cadence;
        }
        self.enabled = true;
        self.next_run = self.cadence.next_after(now);
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        self.next_run = None;
    }
}

/// Body of `POST /maintenance/scheduler`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerCommand {
    pub action: SchedulerAction,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerAction {
    Start,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_run_follows_the_last_run() {
        let now = Utc::now();
        let mut job = ScheduledJob::new("storage-cleanup", Cadence::every(60), now);
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::seconds(60)));

        let later = now + Duration::seconds(90);
        job.mark_ran(later);
        assert_eq!(job.last_run, Some(later));
        assert_eq!(job.next_run, Some(later + Duration::seconds(60)));
    }

    #[test]
    fn five_field_cron_runs_at_midnight() {
        let cadence = Cadence::cron("0 0 * * *").unwrap();
        assert_eq!(
            cadence,
            Cadence::Cron {
                expression: "0 0 0 * * *".into()
            }
        );

        let morning = Utc.with_ymd_and_hms(2026, 3, 14, 10, 30, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(cadence.next_after(morning), Some(midnight));
    }

    #[test]
    fn malformed_cron_is_invalid_params() {
        assert!(matches!(
            Cadence::cron("every day please"),
            Err(UploadError::InvalidParams(_))
        ));
    }

    #[test]
    fn stopped_jobs_never_come_due() {
        let now = Utc::now();
        let mut job = ScheduledJob::new("storage-cleanup", Cadence::every(1), now);
        job.stop();
        assert!(!job.is_due(now + Duration::days(1)));
        assert!(job.wait_from(now).is_none());

        job.mark_ran(now);
        assert!(job.next_run.is_none());

        job.start(None, now);
        assert!(job.enabled);
        assert_eq!(job.next_run, Some(now + Duration::seconds(1)));
    }

    #[test]
    fn start_with_a_cadence_reschedules_a_running_job() {
        let now = Utc::now();
        let mut job = ScheduledJob::new("storage-cleanup", Cadence::every(3600), now);
        let before = job.next_run;

        job.start(None, now + Duration::seconds(5));
        assert_eq!(job.next_run, before);

        job.start(Some(Cadence::every(60)), now);
        assert_eq!(job.cadence, Cadence::every(60));
        assert_eq!(job.next_run, Some(now + Duration::seconds(60)));
    }
}
