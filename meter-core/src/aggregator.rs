use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;
use tracing::info;

use crate::calendar::{hour_ceil, local_date, month_start, previous_month_start, start_of_day};
use crate::clock::Clock;
use crate::durable::UsageRepository;
use crate::error::Error;

/// Rolls raw hourly usage into daily and monthly summaries and prunes raw rows.
///
/// Every operation is safe to repeat: rollups replace the rows of their
/// period instead of adding to them, and cleanup only removes hourly rows that
/// a daily rollup already covers.
#[async_trait]
pub trait UsageAggregator: Send + Sync {
    /// Rolls up the previous business day. Returns the day rolled up.
    async fn aggregate_daily_usage(&self) -> Result<NaiveDate, Error>;

    /// Rolls up the previous business month. Returns its first day.
    async fn aggregate_monthly_usage(&self) -> Result<NaiveDate, Error>;

    /// Deletes rolled-up hourly rows from before the retention window.
    async fn cleanup_old_usage_data(&self, retention_days: u32) -> Result<u64, Error>;
}

pub struct RepositoryAggregator {
    repo: Arc<dyn UsageRepository>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
}

impl RepositoryAggregator {
    pub fn new(repo: Arc<dyn UsageRepository>, clock: Arc<dyn Clock>, timezone: Tz) -> Self {
        Self {
            repo,
            clock,
            timezone,
        }
    }

    pub fn today(&self) -> NaiveDate {
        local_date(self.timezone, self.clock.now())
    }

    /// Rolls up an arbitrary business day, for backfills.
    pub async fn aggregate_day(&self, day: NaiveDate) -> Result<u64, Error> {
        let next = day.succ_opt().unwrap_or(day);
        let from = hour_ceil(start_of_day(self.timezone, day));
        let to = hour_ceil(start_of_day(self.timezone, next));
        let rows = self.repo.rollup_daily(day, from, to).await?;
        info!(%day, rows, "Daily usage rollup complete");
        Ok(rows)
    }
}

#[async_trait]
impl UsageAggregator for RepositoryAggregator {
    async fn aggregate_daily_usage(&self) -> Result<NaiveDate, Error> {
        let today = self.today();
        let day = today.pred_opt().unwrap_or(today);
        self.aggregate_day(day).await?;
        Ok(day)
    }

    async fn aggregate_monthly_usage(&self) -> Result<NaiveDate, Error> {
        let today = self.today();
        let month = previous_month_start(today);
        let rows = self
            .repo
            .rollup_monthly(month, month, month_start(today))
            .await?;
        info!(%month, rows, "Monthly usage rollup complete");
        Ok(month)
    }

    async fn cleanup_old_usage_data(&self, retention_days: u32) -> Result<u64, Error> {
        let cutoff_day = self.today() - Duration::days(i64::from(retention_days));
        let cutoff = start_of_day(self.timezone, cutoff_day);
        let deleted = self.repo.delete_hourly_before(cutoff).await?;
        info!(%cutoff, deleted, retention_days, "Usage retention cleanup complete");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::durable::{MemoryUsageRepository, ResourceType, UsageRecord, UsageTotals};
    use chrono::{TimeZone, Utc};

    fn shanghai(y: i32, m: u32, d: u32, h: u32) -> chrono::DateTime<Utc> {
        chrono_tz::Asia::Shanghai
            .with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn record(hour: chrono::DateTime<Utc>, download: u64) -> UsageRecord {
        UsageRecord {
            resource_type: ResourceType::Node,
            resource_id: 7,
            subscription_id: Some(1),
            period_start: hour,
            upload: 0,
            download,
        }
    }

    #[tokio::test]
    async fn test_daily_rollup_uses_business_day_and_is_idempotent() {
        let clock = Arc::new(ManualClock::new(shanghai(2025, 2, 1, 1)));
        let repo = Arc::new(MemoryUsageRepository::new());
        repo.upsert_hourly(&[
            // 00:00 local on Jan 31 is 16:00 UTC on Jan 30
            record(shanghai(2025, 1, 31, 0), 10),
            record(shanghai(2025, 1, 31, 23), 20),
            record(shanghai(2025, 2, 1, 0), 40),
        ])
        .await
        .unwrap();
        let aggregator = RepositoryAggregator::new(repo.clone(), clock, chrono_tz::Asia::Shanghai);

        let day = aggregator.aggregate_daily_usage().await.unwrap();
        assert_eq!(day, NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
        aggregator.aggregate_daily_usage().await.unwrap();
        assert_eq!(repo.daily_total(1, day), UsageTotals::new(0, 30));

        let month = aggregator.aggregate_monthly_usage().await.unwrap();
        assert_eq!(month, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        aggregator.aggregate_monthly_usage().await.unwrap();
        assert_eq!(repo.monthly_total(1, month), UsageTotals::new(0, 30));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_rows_not_rolled_up() {
        let clock = Arc::new(ManualClock::new(shanghai(2025, 5, 1, 3)));
        let repo = Arc::new(MemoryUsageRepository::new());
        let old_rolled = shanghai(2025, 1, 10, 5);
        let old_unrolled = shanghai(2025, 1, 11, 5);
        repo.upsert_hourly(&[record(old_rolled, 1), record(old_unrolled, 2)])
            .await
            .unwrap();
        let aggregator = RepositoryAggregator::new(repo.clone(), clock, chrono_tz::Asia::Shanghai);
        aggregator
            .aggregate_day(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap())
            .await
            .unwrap();

        assert_eq!(aggregator.cleanup_old_usage_data(90).await.unwrap(), 1);
        assert_eq!(repo.hourly_total(1), UsageTotals::new(0, 2));
    }
}
