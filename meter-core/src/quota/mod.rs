//! Per-subscription quota entries cached in the fast store, with a short-lived
//! in-process layer in front, and the admission check built on top of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::durable::PlanType;

mod cache;
mod enforcer;

pub use cache::{QuotaCache, QuotaCacheMetrics};
pub use enforcer::{DenyReason, QuotaDecision, QuotaEnforcer};

/// Everything admission needs to know about a subscription's current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub subscription_id: i64,
    /// Bytes per billing period, 0 = unlimited
    pub limit: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub plan_type: PlanType,
    #[serde(default)]
    pub suspended: bool,
}

/// A cached lookup result. `NotFound` records that the subscription does not
/// exist or is not active, and is kept for a shorter TTL than a `Quota`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CachedQuota {
    Quota(QuotaEntry),
    NotFound,
}

impl CachedQuota {
    pub fn is_null_marker(&self) -> bool {
        matches!(self, CachedQuota::NotFound)
    }

    pub fn into_entry(self) -> Option<QuotaEntry> {
        match self {
            CachedQuota::Quota(entry) => Some(entry),
            CachedQuota::NotFound => None,
        }
    }
}

pub fn quota_key(subscription_id: i64) -> String {
    format!("quota:{subscription_id}")
}

/// `true` while `used` is below `limit`. A limit of 0 never runs out.
pub fn has_quota_remaining(used: u64, limit: u64) -> bool {
    limit == 0 || used < limit
}
