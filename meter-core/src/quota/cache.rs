use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{quota_key, CachedQuota, QuotaEntry};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::durable::{effective_status, SubscriptionRepository, SubscriptionStatus};
use crate::error::{Error, ErrorDetails};
use crate::fast_store::FastStore;

#[derive(Debug, Default)]
pub struct QuotaCacheMetrics {
    pub local_hits: AtomicU64,
    pub store_hits: AtomicU64,
    pub misses: AtomicU64,
    pub loads: AtomicU64,
    pub null_markers_written: AtomicU64,
    pub load_failures: AtomicU64,
    pub suspensions: AtomicU64,
}

impl QuotaCacheMetrics {
    fn record(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(name).increment(1);
    }
}

/// Quota entries keyed by subscription ID.
///
/// Entries live in the fast store as JSON under `quota:{id}` so every process
/// shares them; a small local cache absorbs repeated reads within a process
/// and collapses concurrent misses for the same ID into one load.
pub struct QuotaCache {
    store: Arc<dyn FastStore>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    clock: Arc<dyn Clock>,
    local: Cache<i64, CachedQuota>,
    ttl: Duration,
    null_ttl: Duration,
    load_timeout: Duration,
    metrics: QuotaCacheMetrics,
}

impl QuotaCache {
    pub fn new(
        store: Arc<dyn FastStore>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        clock: Arc<dyn Clock>,
        config: &CacheConfig,
    ) -> Self {
        let local = Cache::builder()
            .max_capacity(config.local_capacity)
            .time_to_live(config.local_ttl())
            .build();
        Self {
            store,
            subscriptions,
            clock,
            local,
            ttl: config.quota_ttl(),
            null_ttl: config.quota_null_ttl(),
            load_timeout: config.load_timeout(),
            metrics: QuotaCacheMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &QuotaCacheMetrics {
        &self.metrics
    }

    /// Cached state for `subscription_id`, or `None` on a cache miss.
    ///
    /// A `Some(CachedQuota::NotFound)` is a hit on the null marker: the
    /// subscription is known not to be usable.
    pub async fn get_quota(&self, subscription_id: i64) -> Result<Option<CachedQuota>, Error> {
        if let Some(cached) = self.local.get(&subscription_id).await {
            QuotaCacheMetrics::record(&self.metrics.local_hits, "meter_quota_local_hits_total");
            return Ok(Some(cached));
        }
        let cached = self.read_store(subscription_id).await?;
        if let Some(cached) = &cached {
            self.local.insert(subscription_id, cached.clone()).await;
        }
        Ok(cached)
    }

    /// Reads the durable subscription and plan and caches the outcome.
    ///
    /// Returns `Ok(None)` (after caching a null marker) when the subscription
    /// or plan is missing or the subscription is not active.
    pub async fn load_quota_by_id(&self, subscription_id: i64) -> Result<Option<QuotaEntry>, Error> {
        let cached = self.load(subscription_id).await?;
        self.local.insert(subscription_id, cached.clone()).await;
        Ok(cached.into_entry())
    }

    /// Cache read with a load on miss. Concurrent misses for the same ID share
    /// one load.
    pub async fn get_or_load(&self, subscription_id: i64) -> Result<Option<QuotaEntry>, Error> {
        if subscription_id <= 0 {
            return Ok(None);
        }
        if let Some(cached) = self.local.get(&subscription_id).await {
            QuotaCacheMetrics::record(&self.metrics.local_hits, "meter_quota_local_hits_total");
            return Ok(cached.into_entry());
        }
        let cached = self
            .local
            .try_get_with(subscription_id, async {
                match self.read_store(subscription_id).await? {
                    Some(cached) => Ok(cached),
                    None => self.load(subscription_id).await,
                }
            })
            .await
            .map_err(|e: Arc<Error>| Error::new_without_logging(e.get_details().clone()))?;
        Ok(cached.into_entry())
    }

    /// Flags a cached entry as suspended. Returns `true` if an entry changed.
    ///
    /// The entry keeps the expiry it was loaded with, so a suspension never
    /// outlives the cached data it applies to. Suspension is one-way here:
    /// clearing it requires [`QuotaCache::invalidate`] or a fresh load, and a
    /// load that lands after this write replaces the flag with durable state.
    pub async fn mark_suspended(&self, subscription_id: i64) -> Result<bool, Error> {
        self.local.invalidate(&subscription_id).await;
        let Some(CachedQuota::Quota(mut entry)) = self.read_store(subscription_id).await? else {
            return Ok(false);
        };
        if entry.suspended {
            return Ok(false);
        }
        entry.suspended = true;
        let value = serde_json::to_string(&CachedQuota::Quota(entry))?;
        if !self
            .store
            .set_keep_ttl(&quota_key(subscription_id), value)
            .await?
        {
            debug!(subscription_id, "Cached quota expired before it could be suspended");
            return Ok(false);
        }
        QuotaCacheMetrics::record(&self.metrics.suspensions, "meter_quota_suspensions_total");
        info!(subscription_id, "Marked cached quota as suspended");
        Ok(true)
    }

    pub async fn invalidate(&self, subscription_id: i64) -> Result<(), Error> {
        self.local.invalidate(&subscription_id).await;
        self.store.del(&quota_key(subscription_id)).await
    }

    async fn read_store(&self, subscription_id: i64) -> Result<Option<CachedQuota>, Error> {
        let Some(raw) = self.store.get(&quota_key(subscription_id)).await? else {
            QuotaCacheMetrics::record(&self.metrics.misses, "meter_quota_misses_total");
            return Ok(None);
        };
        match serde_json::from_str::<CachedQuota>(&raw) {
            Ok(cached) => {
                QuotaCacheMetrics::record(&self.metrics.store_hits, "meter_quota_store_hits_total");
                Ok(Some(cached))
            }
            Err(e) => {
                warn!(subscription_id, "Ignoring unreadable cached quota: {e}");
                QuotaCacheMetrics::record(&self.metrics.misses, "meter_quota_misses_total");
                Ok(None)
            }
        }
    }

    async fn write_store(&self, subscription_id: i64, cached: &CachedQuota, ttl: Duration) -> Result<(), Error> {
        let value = serde_json::to_string(cached)?;
        self.store
            .set_ex(&quota_key(subscription_id), value, ttl)
            .await
    }

    async fn load(&self, subscription_id: i64) -> Result<CachedQuota, Error> {
        QuotaCacheMetrics::record(&self.metrics.loads, "meter_quota_loads_total");
        let found = match timeout(self.load_timeout, self.subscriptions.find_with_plan(subscription_id)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                QuotaCacheMetrics::record(&self.metrics.load_failures, "meter_quota_load_failures_total");
                return Err(e);
            }
            Err(_) => {
                QuotaCacheMetrics::record(&self.metrics.load_failures, "meter_quota_load_failures_total");
                return Err(Error::new(ErrorDetails::DatabaseTimeout {
                    operation: "find_with_plan".to_string(),
                    timeout_ms: self.load_timeout.as_millis() as u64,
                }));
            }
        };

        let now = self.clock.now();
        let (cached, ttl) = match found {
            Some((subscription, plan))
                if effective_status(&subscription, now) == SubscriptionStatus::Active =>
            {
                let entry = QuotaEntry {
                    subscription_id,
                    limit: plan.traffic_limit,
                    period_start: subscription.current_period_start,
                    period_end: subscription.current_period_end,
                    plan_type: plan.plan_type,
                    suspended: false,
                };
                (CachedQuota::Quota(entry), self.ttl)
            }
            _ => {
                debug!(subscription_id, "No active subscription, caching null marker");
                QuotaCacheMetrics::record(
                    &self.metrics.null_markers_written,
                    "meter_quota_null_markers_total",
                );
                (CachedQuota::NotFound, self.null_ttl)
            }
        };

        // The loaded answer is still correct if caching it fails.
        if let Err(e) = self.write_store(subscription_id, &cached, ttl).await {
            warn!(subscription_id, "Failed to cache quota entry: {e}");
        }
        Ok(cached)
    }
}
