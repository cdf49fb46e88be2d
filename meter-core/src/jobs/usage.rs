use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::aggregator::UsageAggregator;
use crate::calendar::local_date;
use crate::clock::Clock;
use crate::error::Error;
use crate::traffic::{FoldReport, TrafficBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted(u64),
    /// Today's daily rollup has not completed yet
    Skipped,
}

/// Remembers the last business day whose daily rollup completed.
#[derive(Debug, Default)]
pub struct RollupTracker {
    last_daily: ArcSwapOption<NaiveDate>,
}

impl RollupTracker {
    pub fn record_daily(&self, day: NaiveDate) {
        self.last_daily.store(Some(Arc::new(day)));
    }

    pub fn last_daily(&self) -> Option<NaiveDate> {
        self.last_daily.load().as_deref().copied()
    }
}

/// The usage job family: fold, daily and monthly rollups, retention cleanup.
pub struct UsageJobs {
    buffer: Arc<TrafficBuffer>,
    aggregator: Arc<dyn UsageAggregator>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    retention_days: u32,
    tracker: RollupTracker,
}

impl UsageJobs {
    pub fn new(
        buffer: Arc<TrafficBuffer>,
        aggregator: Arc<dyn UsageAggregator>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        retention_days: u32,
    ) -> Self {
        Self {
            buffer,
            aggregator,
            clock,
            timezone,
            retention_days,
            tracker: RollupTracker::default(),
        }
    }

    pub fn tracker(&self) -> &RollupTracker {
        &self.tracker
    }

    pub async fn fold(&self) -> Result<FoldReport, Error> {
        self.buffer.fold().await
    }

    pub async fn daily_rollup(&self) -> Result<NaiveDate, Error> {
        let day = self.aggregator.aggregate_daily_usage().await?;
        self.tracker.record_daily(day);
        Ok(day)
    }

    pub async fn monthly_rollup(&self) -> Result<NaiveDate, Error> {
        self.aggregator.aggregate_monthly_usage().await
    }

    /// Runs retention cleanup only once today's daily rollup (which covers
    /// yesterday) has completed in this process.
    pub async fn cleanup(&self) -> Result<CleanupOutcome, Error> {
        let today = local_date(self.timezone, self.clock.now());
        let yesterday = today.pred_opt().unwrap_or(today);
        if self.tracker.last_daily() != Some(yesterday) {
            warn!(
                %today,
                last_daily = ?self.tracker.last_daily(),
                "Skipping usage cleanup until today's daily rollup has completed"
            );
            return Ok(CleanupOutcome::Skipped);
        }
        let deleted = self
            .aggregator
            .cleanup_old_usage_data(self.retention_days)
            .await?;
        info!(deleted, retention_days = self.retention_days, "Usage cleanup finished");
        Ok(CleanupOutcome::Deleted(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::RepositoryAggregator;
    use crate::clock::ManualClock;
    use crate::durable::{MemoryUsageRepository, ResourceType, UsageRecord, UsageRepository};
    use crate::fast_store::MemoryFastStore;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn shanghai(y: i32, m: u32, d: u32, h: u32) -> chrono::DateTime<Utc> {
        chrono_tz::Asia::Shanghai
            .with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn jobs(clock: Arc<ManualClock>, repo: Arc<MemoryUsageRepository>) -> UsageJobs {
        let store = Arc::new(MemoryFastStore::new(clock.clone()));
        let buffer = Arc::new(TrafficBuffer::new(
            store,
            repo.clone(),
            clock.clone(),
            Duration::from_secs(50 * 3600),
        ));
        let aggregator = Arc::new(RepositoryAggregator::new(
            repo,
            clock.clone(),
            chrono_tz::Asia::Shanghai,
        ));
        UsageJobs::new(buffer, aggregator, clock, chrono_tz::Asia::Shanghai, 90)
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_daily_rollup() {
        let clock = Arc::new(ManualClock::new(shanghai(2025, 5, 1, 3)));
        let repo = Arc::new(MemoryUsageRepository::new());
        repo.upsert_hourly(&[UsageRecord {
            resource_type: ResourceType::Node,
            resource_id: 1,
            subscription_id: Some(5),
            period_start: shanghai(2025, 1, 2, 8),
            upload: 1,
            download: 1,
        }])
        .await
        .unwrap();
        let jobs = jobs(clock.clone(), repo.clone());

        assert_eq!(jobs.cleanup().await.unwrap(), CleanupOutcome::Skipped);

        let day = jobs.daily_rollup().await.unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2025, 4, 30).unwrap());
        assert_eq!(jobs.tracker().last_daily(), Some(day));
        // Jan 2 was never rolled up, so its hourly row is kept
        assert_eq!(jobs.cleanup().await.unwrap(), CleanupOutcome::Deleted(0));
        assert_eq!(repo.hourly_row_count(), 1);

        // A new business day needs a new rollup first
        clock.advance(chrono::Duration::days(1));
        assert_eq!(jobs.cleanup().await.unwrap(), CleanupOutcome::Skipped);
    }
}
