//! Periodic job execution.
//!
//! Each registered job has its own trigger loop. A firing spawns an
//! invocation bounded by the job's deadline; for singleton jobs a firing that
//! finds the previous invocation still running is skipped and the job waits
//! for its next occurrence.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorDetails};

mod manager;

pub use manager::SchedulerManager;

#[derive(Debug, Clone)]
pub enum Trigger {
    Interval {
        period: Duration,
        run_immediately: bool,
    },
    /// Evaluated in the scheduler's business timezone.
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Trigger {
    pub fn interval(period: Duration, run_immediately: bool) -> Self {
        Trigger::Interval {
            period,
            run_immediately,
        }
    }

    pub fn cron(expression: &str) -> Result<Self, Error> {
        let schedule = cron::Schedule::from_str(expression).map_err(|e| {
            Error::new(ErrorDetails::InvalidCron {
                expression: expression.to_string(),
                message: e.to_string(),
            })
        })?;
        Ok(Trigger::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// The first cron occurrence strictly after `after`, in `timezone`.
    /// Interval triggers are driven by the runtime timer and return `None`.
    pub fn next_fire(&self, timezone: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { .. } => None,
            Trigger::Cron { schedule, .. } => schedule
                .after(&after.with_timezone(&timezone))
                .next()
                .map(|next| next.with_timezone(&Utc)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Trigger::Interval {
                period,
                run_immediately,
            } => format!(
                "every {}s{}",
                period.as_secs(),
                if *run_immediately { ", immediately" } else { "" }
            ),
            Trigger::Cron { expression, .. } => format!("cron `{expression}`"),
        }
    }
}

/// What an invocation gets to know about itself.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: Arc<str>,
    pub fired_at: DateTime<Utc>,
    /// Cancelled when the scheduler is forced to stop
    pub cancel: CancellationToken,
}

pub type JobHandler = Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Wraps an async closure as a [`JobHandler`].
pub fn handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

pub struct JobSpec {
    pub name: String,
    pub trigger: Trigger,
    pub singleton: bool,
    pub timeout: Duration,
    pub handler: JobHandler,
}

impl JobSpec {
    /// A singleton job with a one hour deadline.
    pub fn new(name: impl Into<String>, trigger: Trigger, handler: JobHandler) -> Self {
        Self {
            name: name.into(),
            trigger,
            singleton: true,
            timeout: Duration::from_secs(3600),
            handler,
        }
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    /// A singleton invocation was still running; this firing was skipped.
    Rescheduled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight invocation finished within the grace period.
    Clean,
    /// The grace period ran out; these jobs were cancelled.
    Forced { cancelled: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStats {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub rescheduled: u64,
    pub running: usize,
    pub last_error: Option<String>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cron_evaluated_in_business_timezone() {
        let trigger = Trigger::cron("0 0 3 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap();
        let next = trigger.next_fire(chrono_tz::Asia::Shanghai, after).unwrap();
        // 03:00 in Shanghai is 19:00 UTC the previous day
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 20, 19, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let err = Trigger::cron("every day at three").unwrap_err();
        assert!(matches!(err.get_details(), ErrorDetails::InvalidCron { .. }));
    }

    #[test]
    fn test_monthly_cron_fires_on_first_day() {
        let trigger = Trigger::cron("0 0 2 1 * *").unwrap();
        let after = chrono_tz::Asia::Shanghai
            .with_ymd_and_hms(2025, 1, 20, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = trigger.next_fire(chrono_tz::Asia::Shanghai, after).unwrap();
        let local = next.with_timezone(&chrono_tz::Asia::Shanghai);
        assert_eq!(
            local,
            chrono_tz::Asia::Shanghai
                .with_ymd_and_hms(2025, 2, 1, 2, 0, 0)
                .unwrap()
        );
    }
}
