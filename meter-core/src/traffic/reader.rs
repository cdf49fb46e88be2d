use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::time::timeout;
use tracing::warn;

use super::{parse_counter, usage_key, DOWNLOAD_FIELD, UPLOAD_FIELD};
use crate::calendar::{day_ceil, hour_bucket, hour_ceil, local_date, start_of_day};
use crate::clock::Clock;
use crate::durable::{PlanType, UsageRepository, UsageTotals};
use crate::error::{Error, ErrorDetails};
use crate::fast_store::{Command, FastStore};

/// Usage of one billing period split by where it was read from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageBreakdown {
    /// Bytes from hours at or after the recency boundary: fast-store counters,
    /// or folded hourly rows while the fast store is down.
    pub recent: UsageTotals,
    /// Bytes from durable daily rows before the recency boundary.
    pub historical: UsageTotals,
    pub recent_degraded: bool,
    pub historical_degraded: bool,
}

impl UsageBreakdown {
    pub fn total(&self) -> u64 {
        self.recent.total().saturating_add(self.historical.total())
    }
}

pub struct UsageReader {
    store: Arc<dyn FastStore>,
    repo: Arc<dyn UsageRepository>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    read_timeout: Duration,
}

impl UsageReader {
    pub fn new(
        store: Arc<dyn FastStore>,
        repo: Arc<dyn UsageRepository>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        read_timeout: Duration,
    ) -> Self {
        Self {
            store,
            repo,
            clock,
            timezone,
            read_timeout,
        }
    }

    /// Start of the previous business day. Days before it are read from
    /// durable daily rows; hours from it onward from the fast store.
    pub fn recency_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = local_date(self.timezone, now);
        let yesterday = today.pred_opt().unwrap_or(today);
        start_of_day(self.timezone, yesterday)
    }

    /// Total bytes used by `subscription_id` in `[period_start, period_end)`.
    pub async fn get_current_period_usage(
        &self,
        subscription_id: i64,
        plan_type: PlanType,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<u64, Error> {
        Ok(self
            .breakdown(subscription_id, plan_type, period_start, period_end)
            .await?
            .total())
    }

    /// Reads both halves concurrently. When the fast store is unavailable the
    /// recent half falls back to folded hourly rows, which lag by at most one
    /// fold. A failing half is logged and counted as zero; the call only fails
    /// if both halves fail.
    pub async fn breakdown(
        &self,
        subscription_id: i64,
        plan_type: PlanType,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<UsageBreakdown, Error> {
        let now = self.clock.now();
        let boundary = self.recency_boundary(now);
        // buckets straddling the boundary were rolled into the previous day
        let recent_from = hour_bucket(period_start).max(hour_ceil(boundary));
        let recent_to = now.min(period_end);

        let (recent, historical) = tokio::join!(
            self.read_recent(subscription_id, plan_type, recent_from, recent_to),
            self.read_historical(subscription_id, plan_type, period_start, period_end.min(boundary)),
        );

        let mut breakdown = UsageBreakdown::default();
        let recent = match recent {
            Ok(totals) => Ok(totals),
            Err(e) => {
                breakdown.recent_degraded = true;
                warn!(subscription_id, "Recent usage unavailable, reading folded hours: {e}");
                self.read_folded(subscription_id, plan_type, recent_from, recent_to)
                    .await
                    .map_err(|_| e)
            }
        };
        match (recent, historical) {
            (Err(recent_error), Err(_)) => return Err(recent_error),
            (recent, historical) => {
                match recent {
                    Ok(totals) => breakdown.recent = totals,
                    Err(e) => {
                        warn!(subscription_id, "Recent usage unavailable, using daily usage only: {e}");
                    }
                }
                match historical {
                    Ok(totals) => breakdown.historical = totals,
                    Err(e) => {
                        breakdown.historical_degraded = true;
                        warn!(subscription_id, "Historical usage unavailable, using recent usage only: {e}");
                    }
                }
            }
        }
        Ok(breakdown)
    }

    /// Sums the hour counters for buckets in `[from, to)`. `from` is a bucket start.
    async fn read_recent(
        &self,
        subscription_id: i64,
        plan_type: PlanType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals, Error> {
        if from >= to {
            return Ok(UsageTotals::default());
        }
        let mut commands = Vec::new();
        for resource_type in plan_type.metered_resources() {
            let mut hour = from;
            while hour < to {
                commands.push(Command::HGetAll {
                    key: usage_key(*resource_type, subscription_id, hour),
                });
                hour += chrono::Duration::hours(1);
            }
        }

        let replies = match timeout(self.read_timeout, self.store.pipeline(&commands)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::new(ErrorDetails::FastStoreTimeout {
                    operation: "read_recent_usage".to_string(),
                    timeout_ms: self.read_timeout.as_millis() as u64,
                }))
            }
        };

        let mut totals = UsageTotals::default();
        for reply in replies {
            let hash = reply.into_hash()?;
            let upload = hash.get(UPLOAD_FIELD).map(|raw| parse_counter(raw)).unwrap_or(0);
            let download = hash.get(DOWNLOAD_FIELD).map(|raw| parse_counter(raw)).unwrap_or(0);
            totals.add(UsageTotals::new(upload, download));
        }
        Ok(totals)
    }

    async fn read_folded(
        &self,
        subscription_id: i64,
        plan_type: PlanType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals, Error> {
        if from >= to {
            return Ok(UsageTotals::default());
        }
        let ids = [subscription_id];
        let query = self
            .repo
            .sum_hourly(&ids, plan_type.metered_resources(), from, to);
        match timeout(self.read_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::DatabaseTimeout {
                operation: "sum_hourly".to_string(),
                timeout_ms: self.read_timeout.as_millis() as u64,
            })),
        }
    }

    async fn read_historical(
        &self,
        subscription_id: i64,
        plan_type: PlanType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals, Error> {
        if from >= to {
            return Ok(UsageTotals::default());
        }
        let from_day = local_date(self.timezone, from);
        let to_day = day_ceil(self.timezone, to);
        let ids = [subscription_id];
        let query = self.repo.sum_daily(
            &ids,
            plan_type.metered_resources(),
            from_day,
            to_day,
        );
        match timeout(self.read_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::DatabaseTimeout {
                operation: "sum_daily".to_string(),
                timeout_ms: self.read_timeout.as_millis() as u64,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{RepositoryAggregator, UsageAggregator};
    use crate::clock::ManualClock;
    use crate::durable::{MemoryUsageRepository, ResourceType};
    use crate::fast_store::MemoryFastStore;
    use crate::traffic::TrafficBuffer;
    use chrono::{NaiveDate, TimeZone};

    const GB: u64 = 1_000_000_000;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryFastStore>,
        repo: Arc<MemoryUsageRepository>,
        buffer: TrafficBuffer,
        reader: UsageReader,
    }

    fn fixture(now: DateTime<Utc>) -> Fixture {
        fixture_in(chrono_tz::Asia::Shanghai, now)
    }

    fn fixture_in(timezone: Tz, now: DateTime<Utc>) -> Fixture {
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(MemoryFastStore::new(clock.clone()));
        let repo = Arc::new(MemoryUsageRepository::new());
        let buffer = TrafficBuffer::new(
            store.clone(),
            repo.clone(),
            clock.clone(),
            Duration::from_secs(50 * 3600),
        );
        let reader = UsageReader::new(
            store.clone(),
            repo.clone(),
            clock.clone(),
            timezone,
            Duration::from_secs(3),
        );
        Fixture {
            clock,
            store,
            repo,
            buffer,
            reader,
        }
    }

    fn shanghai(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Shanghai
            .with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_recency_boundary_is_previous_business_day() {
        let f = fixture(shanghai(2025, 1, 20, 12));
        assert_eq!(f.reader.recency_boundary(f.clock.now()), shanghai(2025, 1, 19, 0));
        // 00:30 local on the 20th is still the 19th in UTC
        let early = shanghai(2025, 1, 20, 0) + chrono::Duration::minutes(30);
        assert_eq!(f.reader.recency_boundary(early), shanghai(2025, 1, 19, 0));
    }

    #[tokio::test]
    async fn test_sides_of_boundary_counted_once() {
        let f = fixture(shanghai(2025, 1, 18, 9));
        // three days ago: folded and rolled up into a daily row
        f.repo.insert_daily(
            ResourceType::Node,
            7,
            Some(1),
            NaiveDate::from_ymd_opt(2025, 1, 17).unwrap(),
            UsageTotals::new(3 * GB, 0),
        );
        // yesterday and today: still in fast-store hour counters
        f.buffer.add_traffic(7, 1, GB, 0).await.unwrap();
        f.clock.set(shanghai(2025, 1, 19, 22));
        f.buffer.add_traffic(7, 1, 0, 2 * GB).await.unwrap();
        f.clock.set(shanghai(2025, 1, 20, 12));
        f.buffer.add_traffic(7, 1, 0, 4 * GB).await.unwrap();

        let breakdown = f
            .reader
            .breakdown(1, PlanType::Node, shanghai(2025, 1, 1, 0), shanghai(2025, 2, 1, 0))
            .await
            .unwrap();
        // the Jan 18 hour counter is before the boundary and must not be read
        assert_eq!(breakdown.historical.total(), 3 * GB);
        assert_eq!(breakdown.recent.total(), 6 * GB);
        assert_eq!(breakdown.total(), 9 * GB);
    }

    #[tokio::test]
    async fn test_period_after_boundary_skips_history() {
        let f = fixture(shanghai(2025, 1, 20, 12));
        f.buffer.add_traffic(7, 1, GB, 0).await.unwrap();
        let used = f
            .reader
            .get_current_period_usage(1, PlanType::Node, shanghai(2025, 1, 20, 0), shanghai(2025, 2, 20, 0))
            .await
            .unwrap();
        assert_eq!(used, GB);
        assert_eq!(f.repo.query_count(), 0);
    }

    #[tokio::test]
    async fn test_plan_type_selects_resources() {
        let f = fixture(shanghai(2025, 1, 20, 12));
        f.buffer.add_traffic(7, 1, GB, 0).await.unwrap();
        f.buffer
            .add_resource_traffic(ResourceType::ForwardRule, 3, &[crate::traffic::TrafficDelta::new(1, 0, 2 * GB)])
            .await
            .unwrap();
        let period = (shanghai(2025, 1, 1, 0), shanghai(2025, 2, 1, 0));
        let node = f.reader.get_current_period_usage(1, PlanType::Node, period.0, period.1).await.unwrap();
        let forward = f.reader.get_current_period_usage(1, PlanType::Forward, period.0, period.1).await.unwrap();
        let hybrid = f.reader.get_current_period_usage(1, PlanType::Hybrid, period.0, period.1).await.unwrap();
        assert_eq!((node, forward, hybrid), (GB, 2 * GB, 3 * GB));
    }

    #[tokio::test]
    async fn test_degrades_to_either_source() {
        let f = fixture(shanghai(2025, 1, 20, 12));
        f.repo.insert_daily(
            ResourceType::Node,
            7,
            Some(1),
            NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
            UsageTotals::new(0, 40 * GB),
        );
        f.buffer.add_traffic(7, 1, 0, 30 * GB).await.unwrap();
        let period = (shanghai(2025, 1, 1, 0), shanghai(2025, 2, 1, 0));

        f.store.set_failing(true);
        let breakdown = f.reader.breakdown(1, PlanType::Node, period.0, period.1).await.unwrap();
        assert!(breakdown.recent_degraded);
        assert_eq!(breakdown.total(), 40 * GB);
        f.store.set_failing(false);

        f.repo.set_failing(true);
        let breakdown = f.reader.breakdown(1, PlanType::Node, period.0, period.1).await.unwrap();
        assert!(breakdown.historical_degraded);
        assert_eq!(breakdown.total(), 30 * GB);

        f.store.set_failing(true);
        assert!(f.reader.breakdown(1, PlanType::Node, period.0, period.1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_durable_read_times_out() {
        let f = fixture(shanghai(2025, 1, 20, 12));
        f.buffer.add_traffic(7, 1, GB, 0).await.unwrap();
        f.repo.set_latency(Some(Duration::from_secs(10)));
        let breakdown = f
            .reader
            .breakdown(1, PlanType::Node, shanghai(2025, 1, 1, 0), shanghai(2025, 2, 1, 0))
            .await
            .unwrap();
        assert!(breakdown.historical_degraded);
        assert_eq!(breakdown.total(), GB);
    }

    #[tokio::test]
    async fn test_fast_store_outage_reads_folded_hours() {
        let f = fixture(shanghai(2025, 1, 20, 9));
        f.buffer.add_traffic(7, 1, 0, 5 * GB).await.unwrap();
        f.buffer.fold().await.unwrap();
        f.clock.set(shanghai(2025, 1, 20, 12));
        f.buffer.add_traffic(7, 1, 0, GB).await.unwrap();

        f.store.set_failing(true);
        let breakdown = f
            .reader
            .breakdown(1, PlanType::Node, shanghai(2025, 1, 1, 0), shanghai(2025, 2, 1, 0))
            .await
            .unwrap();
        // the unfolded gigabyte is invisible until the store recovers
        assert!(breakdown.recent_degraded);
        assert_eq!(breakdown.recent.total(), 5 * GB);
        assert_eq!(breakdown.total(), 5 * GB);
    }

    #[tokio::test]
    async fn test_half_hour_midnight_bucket_counted_once() {
        let tz = chrono_tz::Asia::Kolkata;
        let at = |d: u32, h: u32, m: u32| tz.with_ymd_and_hms(2025, 1, d, h, m, 0).unwrap().with_timezone(&Utc);
        // 23:40 local lands in the 18:00 UTC bucket, which runs to 00:30 local
        let f = fixture_in(tz, at(18, 23, 40));
        f.buffer.add_traffic(7, 1, 0, 10 * GB).await.unwrap();
        f.clock.set(at(19, 1, 0));
        f.buffer.fold().await.unwrap();
        let aggregator = RepositoryAggregator::new(f.repo.clone(), f.clock.clone(), tz);
        aggregator.aggregate_daily_usage().await.unwrap();
        assert_eq!(f.repo.daily_total(1, NaiveDate::from_ymd_opt(2025, 1, 18).unwrap()).total(), 10 * GB);

        f.clock.set(at(20, 12, 0));
        let boundary = f.reader.recency_boundary(f.clock.now());
        assert!(hour_ceil(boundary) > boundary);
        let breakdown = f
            .reader
            .breakdown(1, PlanType::Node, at(1, 0, 0), at(31, 0, 0))
            .await
            .unwrap();
        assert_eq!((breakdown.historical.total(), breakdown.recent.total()), (10 * GB, 0));
    }

    /// Drives writes, folds and daily rollups the way the scheduler would and
    /// checks after every step that each byte is counted exactly once.
    #[tokio::test]
    async fn test_every_byte_counted_once_across_timezones() {
        let zones = [
            chrono_tz::Asia::Shanghai,
            chrono_tz::Asia::Kolkata,
            chrono_tz::Asia::Kathmandu,
            chrono_tz::Australia::Adelaide,
            chrono_tz::America::New_York,
        ];
        // New York falls back on Nov 3 and springs forward on Mar 10
        let windows = [
            Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap(),
        ];
        let step = chrono::Duration::minutes(37);

        for tz in zones {
            for start in windows {
                let f = fixture_in(tz, start);
                let aggregator = RepositoryAggregator::new(f.repo.clone(), f.clock.clone(), tz);
                let first_day = local_date(tz, start);
                let period_start = start_of_day(tz, first_day - chrono::Duration::days(3));
                let period_end = period_start + chrono::Duration::days(40);
                let mut written = 0u64;
                let mut rolled_on = None;

                for i in 0..200u64 {
                    let now = start + step * i32::try_from(i).unwrap();
                    f.clock.set(now);
                    let bytes = 1_000 + i * 7;
                    f.buffer.add_traffic(7, 1, bytes, 0).await.unwrap();
                    written += bytes;
                    f.buffer.fold().await.unwrap();

                    let today = local_date(tz, now);
                    let rollup_due = now >= start_of_day(tz, today) + chrono::Duration::hours(1);
                    if rollup_due && rolled_on != Some(today) {
                        aggregator.aggregate_daily_usage().await.unwrap();
                        rolled_on = Some(today);
                    }

                    let breakdown = f
                        .reader
                        .breakdown(1, PlanType::Node, period_start, period_end)
                        .await
                        .unwrap();
                    assert_eq!(breakdown.total(), written, "{tz} at {now}: {breakdown:?}");
                }
            }
        }
    }
}
