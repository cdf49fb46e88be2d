//! TTL-bound snapshot cache translating external string IDs (SIDs) to internal IDs.
//!
//! Readers always see a complete snapshot swapped in atomically. A refresh is
//! claimed through [`MetadataCache::try_begin_refresh`], which hands out at most
//! one [`RefreshPermit`] per stale window; the permit is consumed by either
//! [`RefreshPermit::finish`] or [`RefreshPermit::abort`] (dropping it aborts).
//! A failed refresh leaves the last good snapshot in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::Error;

struct Snapshot<T> {
    by_id: HashMap<i64, Arc<T>>,
    sid_to_id: HashMap<String, i64>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl<T> Snapshot<T> {
    fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
            sid_to_id: HashMap::new(),
            refreshed_at: None,
        }
    }
}

/// Result of a SID lookup. `ids[i]` is the ID of `items[i]`.
#[derive(Debug)]
pub struct Lookup<T> {
    pub ids: Vec<i64>,
    pub items: Vec<Arc<T>>,
}

#[derive(Debug, Default)]
pub struct MetadataCacheMetrics {
    pub refreshes: AtomicU64,
    pub aborted_refreshes: AtomicU64,
    pub contended_refreshes: AtomicU64,
}

pub struct MetadataCache<T> {
    snapshot: ArcSwap<Snapshot<T>>,
    refreshing: AtomicBool,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    metrics: MetadataCacheMetrics,
}

impl<T> MetadataCache<T> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::empty()),
            refreshing: AtomicBool::new(false),
            ttl,
            clock,
            metrics: MetadataCacheMetrics::default(),
        }
    }

    pub fn is_stale(&self) -> bool {
        match self.snapshot.load().refreshed_at {
            None => true,
            Some(at) => {
                let age = (self.clock.now() - at).to_std().unwrap_or(Duration::ZERO);
                age >= self.ttl
            }
        }
    }

    /// Claims the right to refresh. Returns `None` if the snapshot is fresh or
    /// another caller already holds the permit.
    pub fn try_begin_refresh(&self) -> Option<RefreshPermit<'_, T>> {
        if !self.is_stale() {
            return None;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.metrics.contended_refreshes.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        // Another caller may have finished between the first check and the claim.
        if !self.is_stale() {
            self.refreshing.store(false, Ordering::Release);
            return None;
        }
        Some(RefreshPermit {
            cache: self,
            done: false,
        })
    }

    pub fn get(&self, id: i64) -> Option<Arc<T>> {
        self.snapshot.load().by_id.get(&id).cloned()
    }

    pub fn id_for_sid(&self, sid: &str) -> Option<i64> {
        self.snapshot.load().sid_to_id.get(sid).copied()
    }

    /// Items for `sids`, or every item when `sids` is `None`. Unknown SIDs are skipped.
    pub fn get_by_sids<S: AsRef<str>>(&self, sids: Option<&[S]>) -> Lookup<T> {
        let snapshot = self.snapshot.load();
        let ids: Vec<i64> = match sids {
            Some(sids) => sids
                .iter()
                .filter_map(|sid| snapshot.sid_to_id.get(sid.as_ref()).copied())
                .collect(),
            None => {
                let mut ids: Vec<i64> = snapshot.by_id.keys().copied().collect();
                ids.sort_unstable();
                ids
            }
        };
        let mut lookup = Lookup {
            ids: Vec::with_capacity(ids.len()),
            items: Vec::with_capacity(ids.len()),
        };
        for id in ids {
            if let Some(item) = snapshot.by_id.get(&id) {
                lookup.ids.push(id);
                lookup.items.push(Arc::clone(item));
            }
        }
        lookup
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.load().refreshed_at
    }

    pub fn metrics(&self) -> &MetadataCacheMetrics {
        &self.metrics
    }
}

/// Exclusive right to replace the snapshot of a [`MetadataCache`].
pub struct RefreshPermit<'a, T> {
    cache: &'a MetadataCache<T>,
    done: bool,
}

impl<T> RefreshPermit<'_, T> {
    /// Swaps in a snapshot built from `items` and stamps the refresh time.
    pub fn finish<I, S>(mut self, items: I, id_of: impl Fn(&T) -> i64, sid_of: impl Fn(&T) -> S)
    where
        I: IntoIterator<Item = T>,
        S: Into<String>,
    {
        let mut by_id = HashMap::new();
        let mut sid_to_id = HashMap::new();
        for item in items {
            let id = id_of(&item);
            sid_to_id.insert(sid_of(&item).into(), id);
            by_id.insert(id, Arc::new(item));
        }
        self.cache.snapshot.store(Arc::new(Snapshot {
            by_id,
            sid_to_id,
            refreshed_at: Some(self.cache.clock.now()),
        }));
        self.cache.metrics.refreshes.fetch_add(1, Ordering::Relaxed);
        self.done = true;
        self.cache.refreshing.store(false, Ordering::Release);
    }

    /// Releases the permit and keeps the current snapshot.
    pub fn abort(self) {}
}

impl<T> Drop for RefreshPermit<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.cache
                .metrics
                .aborted_refreshes
                .fetch_add(1, Ordering::Relaxed);
            self.cache.refreshing.store(false, Ordering::Release);
        }
    }
}

/// Something with an internal numeric ID and an external string ID.
pub trait MetadataItem: Send + Sync + 'static {
    fn id(&self) -> i64;
    fn sid(&self) -> &str;
}

#[async_trait]
pub trait MetadataSource<T>: Send + Sync {
    async fn load_all(&self) -> Result<Vec<T>, Error>;
}

/// A [`MetadataCache`] that refreshes itself from a [`MetadataSource`] when stale.
pub struct CachedDirectory<T> {
    cache: MetadataCache<T>,
    source: Arc<dyn MetadataSource<T>>,
    name: &'static str,
}

impl<T: MetadataItem> CachedDirectory<T> {
    pub fn new(
        name: &'static str,
        source: Arc<dyn MetadataSource<T>>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache: MetadataCache::new(ttl, clock),
            source,
            name,
        }
    }

    /// Refreshes the snapshot if it is stale and nobody else is refreshing.
    pub async fn ensure_fresh(&self) {
        let Some(permit) = self.cache.try_begin_refresh() else {
            return;
        };
        match self.source.load_all().await {
            Ok(items) => {
                let count = items.len();
                permit.finish(items, |item| item.id(), |item| item.sid().to_string());
                metrics::counter!("meter_metadata_refreshes_total", "directory" => self.name)
                    .increment(1);
                tracing::debug!(directory = self.name, count, "Refreshed metadata snapshot");
            }
            Err(e) => {
                permit.abort();
                metrics::counter!("meter_metadata_refresh_failures_total", "directory" => self.name)
                    .increment(1);
                tracing::warn!(
                    directory = self.name,
                    "Metadata refresh failed, serving previous snapshot: {e}"
                );
            }
        }
    }

    pub async fn resolve<S: AsRef<str>>(&self, sids: Option<&[S]>) -> Lookup<T> {
        self.ensure_fresh().await;
        self.cache.get_by_sids(sids)
    }

    pub async fn id_for_sid(&self, sid: &str) -> Option<i64> {
        self.ensure_fresh().await;
        self.cache.id_for_sid(sid)
    }

    pub fn cache(&self) -> &MetadataCache<T> {
        &self.cache
    }
}
