//! System-of-record models and the repository contracts the accounting core
//! needs from the durable store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::Error;
use crate::metadata_cache::MetadataItem;

pub mod memory;
pub mod postgres;

pub use memory::{MemorySubscriptionRepository, MemoryUsageRepository};
pub use postgres::{PgSubscriptionRepository, PgUsageRepository};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    Node,
    ForwardRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanType {
    Node,
    Forward,
    Hybrid,
}

impl PlanType {
    /// Resource types whose traffic counts against a plan of this type.
    pub fn metered_resources(self) -> &'static [ResourceType] {
        match self {
            PlanType::Node => &[ResourceType::Node],
            PlanType::Forward => &[ResourceType::ForwardRule],
            PlanType::Hybrid => &[ResourceType::Node, ResourceType::ForwardRule],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    PendingPayment,
    Active,
    Suspended,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: i64,
    pub sid: String,
    pub user_id: i64,
    pub plan_id: i64,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub id: i64,
    pub plan_type: PlanType,
    /// Bytes per billing period, 0 = unlimited
    pub traffic_limit: u64,
}

/// Status as admission should see it right now.
///
/// The stored status only changes when the expiry sweep runs, so an active
/// subscription whose `end_at` has passed is reported as expired here.
pub fn effective_status(subscription: &Subscription, now: DateTime<Utc>) -> SubscriptionStatus {
    match (subscription.status, subscription.end_at) {
        (SubscriptionStatus::Active, Some(end_at)) if end_at <= now => SubscriptionStatus::Expired,
        (status, _) => status,
    }
}

/// SID to ID mapping of a subscription, as held by the metadata cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRef {
    pub id: i64,
    pub sid: String,
}

impl MetadataItem for SubscriptionRef {
    fn id(&self) -> i64 {
        self.id
    }

    fn sid(&self) -> &str {
        &self.sid
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub upload: u64,
    pub download: u64,
}

impl UsageTotals {
    pub fn new(upload: u64, download: u64) -> Self {
        Self { upload, download }
    }

    pub fn total(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }

    pub fn add(&mut self, other: UsageTotals) {
        self.upload = self.upload.saturating_add(other.upload);
        self.download = self.download.saturating_add(other.download);
    }
}

/// One hourly usage row. `subscription_id = None` means the traffic has no
/// billing attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub resource_type: ResourceType,
    pub resource_id: i64,
    pub subscription_id: Option<i64>,
    pub period_start: DateTime<Utc>,
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct UsageKey {
    pub resource_type: ResourceType,
    pub resource_id: i64,
    pub subscription_id: Option<i64>,
    pub period_start: DateTime<Utc>,
}

impl UsageRecord {
    pub(crate) fn key(&self) -> UsageKey {
        UsageKey {
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            subscription_id: self.subscription_id,
            period_start: self.period_start,
        }
    }
}

/// Sums records sharing a key so a batch never touches the same row twice.
pub(crate) fn merge_records(records: &[UsageRecord]) -> Vec<UsageRecord> {
    let mut merged: HashMap<UsageKey, UsageRecord> = HashMap::with_capacity(records.len());
    for record in records {
        merged
            .entry(record.key())
            .and_modify(|existing| {
                existing.upload = existing.upload.saturating_add(record.upload);
                existing.download = existing.download.saturating_add(record.download);
            })
            .or_insert_with(|| record.clone());
    }
    merged.into_values().collect()
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    /// The subscription and its plan, or `None` if either does not exist.
    async fn find_with_plan(&self, subscription_id: i64) -> Result<Option<(Subscription, Plan)>, Error>;

    /// Stores `expired` for active subscriptions whose `end_at` is at or before `now`.
    async fn mark_expired(&self, now: DateTime<Utc>) -> Result<u64, Error>;

    /// Active subscriptions whose `end_at` falls in `[from, to)`, soonest first.
    async fn find_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, Error>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Adds each record onto its hourly row, creating the row if needed.
    async fn upsert_hourly(&self, records: &[UsageRecord]) -> Result<(), Error>;

    /// Sum of daily rows for business days in `[from, to)`.
    async fn sum_daily(
        &self,
        subscription_ids: &[i64],
        resource_types: &[ResourceType],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<UsageTotals, Error>;

    /// Sum of raw hourly rows with `period_start` in `[from, to)`.
    async fn sum_hourly(
        &self,
        subscription_ids: &[i64],
        resource_types: &[ResourceType],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals, Error>;

    /// Replaces the daily rows of `day` with the sums of hourly rows in `[from, to)`.
    /// Returns the number of daily rows written.
    async fn rollup_daily(&self, day: NaiveDate, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, Error>;

    /// Replaces the monthly rows of `month` (its first day) with the sums of
    /// daily rows for days in `[from, to)`.
    async fn rollup_monthly(&self, month: NaiveDate, from: NaiveDate, to: NaiveDate) -> Result<u64, Error>;

    /// Deletes hourly rows older than `cutoff` that fall inside a rolled-up day.
    async fn delete_hourly_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error>;
}
