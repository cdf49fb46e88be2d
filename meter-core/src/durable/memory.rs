//! In-memory repositories for tests and dry runs. Every trait call counts as
//! one query so callers can assert how often the durable store was touched.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::{
    merge_records, Plan, ResourceType, Subscription, SubscriptionRef, SubscriptionRepository,
    SubscriptionStatus, UsageKey, UsageRecord, UsageRepository, UsageTotals,
};
use crate::error::{Error, ErrorDetails};
use crate::metadata_cache::MetadataSource;

#[derive(Default)]
struct Faults {
    failing: AtomicBool,
    latency: Mutex<Option<Duration>>,
    queries: AtomicU64,
}

impl Faults {
    async fn enter(&self, operation: &str) -> Result<(), Error> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency.lock().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::Database {
                message: format!("`{operation}` failed: connection reset"),
            }));
        }
        Ok(())
    }

    fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }
}

fn poisoned() -> Error {
    Error::new(ErrorDetails::Database {
        message: "memory repository lock poisoned".to_string(),
    })
}

#[derive(Default)]
pub struct MemorySubscriptionRepository {
    subscriptions: Mutex<HashMap<i64, Subscription>>,
    plans: Mutex<HashMap<i64, Plan>>,
    faults: Faults,
}

impl MemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_plan(&self, plan: Plan) {
        if let Ok(mut plans) = self.plans.lock() {
            plans.insert(plan.id, plan);
        }
    }

    pub fn insert_subscription(&self, subscription: Subscription) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.insert(subscription.id, subscription);
        }
    }

    pub fn subscription(&self, id: i64) -> Option<Subscription> {
        self.subscriptions.lock().ok()?.get(&id).cloned()
    }

    pub fn query_count(&self) -> u64 {
        self.faults.queries.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.faults.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.set_latency(latency);
    }
}

#[async_trait]
impl SubscriptionRepository for MemorySubscriptionRepository {
    async fn find_with_plan(&self, subscription_id: i64) -> Result<Option<(Subscription, Plan)>, Error> {
        self.faults.enter("find_with_plan").await?;
        let subscription = match self.subscriptions.lock().map_err(|_| poisoned())?.get(&subscription_id) {
            Some(subscription) => subscription.clone(),
            None => return Ok(None),
        };
        let plan = self
            .plans
            .lock()
            .map_err(|_| poisoned())?
            .get(&subscription.plan_id)
            .cloned();
        Ok(plan.map(|plan| (subscription, plan)))
    }

    async fn mark_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        self.faults.enter("mark_expired").await?;
        let mut subscriptions = self.subscriptions.lock().map_err(|_| poisoned())?;
        let mut expired = 0;
        for subscription in subscriptions.values_mut() {
            let ended = subscription.end_at.is_some_and(|end_at| end_at <= now);
            if subscription.status == SubscriptionStatus::Active && ended {
                subscription.status = SubscriptionStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn find_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, Error> {
        self.faults.enter("find_ending_between").await?;
        let subscriptions = self.subscriptions.lock().map_err(|_| poisoned())?;
        let mut ending: Vec<Subscription> = subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .filter(|s| s.end_at.is_some_and(|end_at| end_at >= from && end_at < to))
            .cloned()
            .collect();
        ending.sort_by_key(|s| (s.end_at, s.id));
        Ok(ending)
    }
}

#[async_trait]
impl MetadataSource<SubscriptionRef> for MemorySubscriptionRepository {
    async fn load_all(&self) -> Result<Vec<SubscriptionRef>, Error> {
        self.faults.enter("load_subscription_refs").await?;
        let subscriptions = self.subscriptions.lock().map_err(|_| poisoned())?;
        Ok(subscriptions
            .values()
            .map(|s| SubscriptionRef {
                id: s.id,
                sid: s.sid.clone(),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RollupKey {
    resource_type: ResourceType,
    resource_id: i64,
    subscription_id: Option<i64>,
}

#[derive(Default)]
struct UsageTables {
    hourly: HashMap<UsageKey, UsageTotals>,
    daily: BTreeMap<NaiveDate, HashMap<RollupKey, UsageTotals>>,
    monthly: BTreeMap<NaiveDate, HashMap<RollupKey, UsageTotals>>,
    rollups: BTreeMap<NaiveDate, (DateTime<Utc>, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryUsageRepository {
    tables: Mutex<UsageTables>,
    faults: Faults,
}

fn sum_matching<'a>(
    rows: impl Iterator<Item = (&'a RollupKey, &'a UsageTotals)>,
    subscription_ids: &[i64],
    resource_types: &[ResourceType],
) -> UsageTotals {
    let mut totals = UsageTotals::default();
    for (key, row) in rows {
        let attributed = key
            .subscription_id
            .is_some_and(|id| subscription_ids.contains(&id));
        if attributed && resource_types.contains(&key.resource_type) {
            totals.add(*row);
        }
    }
    totals
}

impl MemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an already-aggregated daily row.
    pub fn insert_daily(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        subscription_id: Option<i64>,
        day: NaiveDate,
        totals: UsageTotals,
    ) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.daily.entry(day).or_default().insert(
                RollupKey {
                    resource_type,
                    resource_id,
                    subscription_id,
                },
                totals,
            );
        }
    }

    pub fn hourly_row_count(&self) -> usize {
        self.tables.lock().map(|t| t.hourly.len()).unwrap_or(0)
    }

    /// Sum of all hourly rows attributed to `subscription_id`.
    pub fn hourly_total(&self, subscription_id: i64) -> UsageTotals {
        let mut totals = UsageTotals::default();
        if let Ok(tables) = self.tables.lock() {
            for (key, row) in &tables.hourly {
                if key.subscription_id == Some(subscription_id) {
                    totals.add(*row);
                }
            }
        }
        totals
    }

    pub fn daily_total(&self, subscription_id: i64, day: NaiveDate) -> UsageTotals {
        let mut totals = UsageTotals::default();
        if let Ok(tables) = self.tables.lock() {
            if let Some(rows) = tables.daily.get(&day) {
                for (key, row) in rows {
                    if key.subscription_id == Some(subscription_id) {
                        totals.add(*row);
                    }
                }
            }
        }
        totals
    }

    pub fn monthly_total(&self, subscription_id: i64, month: NaiveDate) -> UsageTotals {
        let mut totals = UsageTotals::default();
        if let Ok(tables) = self.tables.lock() {
            if let Some(rows) = tables.monthly.get(&month) {
                for (key, row) in rows {
                    if key.subscription_id == Some(subscription_id) {
                        totals.add(*row);
                    }
                }
            }
        }
        totals
    }

    pub fn query_count(&self) -> u64 {
        self.faults.queries.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.faults.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.set_latency(latency);
    }
}

#[async_trait]
impl UsageRepository for MemoryUsageRepository {
    async fn upsert_hourly(&self, records: &[UsageRecord]) -> Result<(), Error> {
        self.faults.enter("upsert_hourly").await?;
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        for record in merge_records(records) {
            tables
                .hourly
                .entry(record.key())
                .or_default()
                .add(UsageTotals::new(record.upload, record.download));
        }
        Ok(())
    }

    async fn sum_daily(
        &self,
        subscription_ids: &[i64],
        resource_types: &[ResourceType],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<UsageTotals, Error> {
        self.faults.enter("sum_daily").await?;
        if from >= to {
            return Ok(UsageTotals::default());
        }
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        let mut totals = UsageTotals::default();
        for rows in tables.daily.range(from..to).map(|(_, rows)| rows) {
            totals.add(sum_matching(rows.iter(), subscription_ids, resource_types));
        }
        Ok(totals)
    }

    async fn sum_hourly(
        &self,
        subscription_ids: &[i64],
        resource_types: &[ResourceType],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals, Error> {
        self.faults.enter("sum_hourly").await?;
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        let mut totals = UsageTotals::default();
        for (key, row) in &tables.hourly {
            let in_range = key.period_start >= from && key.period_start < to;
            let attributed = key
                .subscription_id
                .is_some_and(|id| subscription_ids.contains(&id));
            if in_range && attributed && resource_types.contains(&key.resource_type) {
                totals.add(*row);
            }
        }
        Ok(totals)
    }

    async fn rollup_daily(&self, day: NaiveDate, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, Error> {
        self.faults.enter("rollup_daily").await?;
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        let mut rows: HashMap<RollupKey, UsageTotals> = HashMap::new();
        for (key, row) in &tables.hourly {
            if key.period_start >= from && key.period_start < to {
                rows.entry(RollupKey {
                    resource_type: key.resource_type,
                    resource_id: key.resource_id,
                    subscription_id: key.subscription_id,
                })
                .or_default()
                .add(*row);
            }
        }
        let written = rows.len() as u64;
        tables.daily.insert(day, rows);
        tables.rollups.insert(day, (from, to));
        Ok(written)
    }

    async fn rollup_monthly(&self, month: NaiveDate, from: NaiveDate, to: NaiveDate) -> Result<u64, Error> {
        self.faults.enter("rollup_monthly").await?;
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        let mut rows: HashMap<RollupKey, UsageTotals> = HashMap::new();
        if from < to {
            for day_rows in tables.daily.range(from..to).map(|(_, rows)| rows) {
                for (key, row) in day_rows {
                    rows.entry(*key).or_default().add(*row);
                }
            }
        }
        let written = rows.len() as u64;
        tables.monthly.insert(month, rows);
        Ok(written)
    }

    async fn delete_hourly_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        self.faults.enter("delete_hourly_before").await?;
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        let ranges: Vec<(DateTime<Utc>, DateTime<Utc>)> = tables.rollups.values().copied().collect();
        let before = tables.hourly.len();
        tables.hourly.retain(|key, _| {
            let rolled_up = ranges
                .iter()
                .any(|(start, end)| key.period_start >= *start && key.period_start < *end);
            !(key.period_start < cutoff && rolled_up)
        });
        Ok((before - tables.hourly.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(sub: Option<i64>, hour: DateTime<Utc>, upload: u64, download: u64) -> UsageRecord {
        UsageRecord {
            resource_type: ResourceType::Node,
            resource_id: 1,
            subscription_id: sub,
            period_start: hour,
            upload,
            download,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_additive() {
        let repo = MemoryUsageRepository::new();
        let hour = Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap();
        repo.upsert_hourly(&[record(Some(1), hour, 5, 5)]).await.unwrap();
        repo.upsert_hourly(&[record(Some(1), hour, 1, 2)]).await.unwrap();
        assert_eq!(repo.hourly_row_count(), 1);
        assert_eq!(repo.hourly_total(1), UsageTotals::new(6, 7));
    }

    #[tokio::test]
    async fn test_rollup_daily_replaces_and_cleanup_respects_rollups() {
        let repo = MemoryUsageRepository::new();
        let day = NaiveDate::from_ymd_opt(2025, 1, 19).unwrap();
        let from = Utc.with_ymd_and_hms(2025, 1, 19, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap();
        repo.upsert_hourly(&[
            record(Some(1), from, 10, 0),
            record(Some(1), from + chrono::Duration::hours(5), 0, 30),
            record(None, from, 100, 100),
            // next day, not rolled up yet
            record(Some(1), to, 1, 1),
        ])
        .await
        .unwrap();

        assert_eq!(repo.rollup_daily(day, from, to).await.unwrap(), 2);
        assert_eq!(repo.rollup_daily(day, from, to).await.unwrap(), 2);
        assert_eq!(repo.daily_total(1, day), UsageTotals::new(10, 30));

        let deleted = repo
            .delete_hourly_before(to + chrono::Duration::days(10))
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(repo.hourly_total(1), UsageTotals::new(1, 1));
    }

    #[tokio::test]
    async fn test_sum_hourly_is_half_open() {
        let repo = MemoryUsageRepository::new();
        let from = Utc.with_ymd_and_hms(2025, 1, 20, 10, 0, 0).unwrap();
        let to = from + chrono::Duration::hours(2);
        repo.upsert_hourly(&[
            record(Some(1), from - chrono::Duration::hours(1), 100, 0),
            record(Some(1), from, 1, 0),
            record(Some(1), from + chrono::Duration::hours(1), 2, 0),
            record(Some(1), to, 100, 0),
            record(Some(2), from, 100, 0),
            record(None, from, 100, 0),
        ])
        .await
        .unwrap();

        let totals = repo
            .sum_hourly(&[1], &[ResourceType::Node], from, to)
            .await
            .unwrap();
        assert_eq!(totals, UsageTotals::new(3, 0));
        let forward = repo
            .sum_hourly(&[1], &[ResourceType::ForwardRule], from, to)
            .await
            .unwrap();
        assert_eq!(forward, UsageTotals::default());
    }

    #[tokio::test]
    async fn test_find_with_plan_missing_plan() {
        let repo = MemorySubscriptionRepository::new();
        repo.insert_subscription(Subscription {
            id: 1,
            sid: "sub_1".to_string(),
            user_id: 1,
            plan_id: 42,
            status: SubscriptionStatus::Active,
            current_period_start: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            current_period_end: Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            end_at: None,
        });
        assert!(repo.find_with_plan(1).await.unwrap().is_none());
        assert_eq!(repo.query_count(), 1);
    }
}
