//! Recently-seen devices per subscription and subscriptions per node.
//!
//! Both are sorted sets scored by unix time. Entries older than the staleness
//! threshold are pruned on every write and before every read, and each key
//! expires one threshold after its last write, so nothing needs a sweeper.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::Clock;
use crate::error::Error;
use crate::fast_store::{unix_score, Command, FastStore};

/// Live-status hashes expire this long after the last report.
pub const STATUS_TTL: Duration = Duration::from_secs(300);

pub fn device_online_key(subscription_id: i64) -> String {
    format!("device_online:{subscription_id}")
}

pub fn node_online_key(node_id: i64) -> String {
    format!("node_online_subs:{node_id}")
}

/// One subscription seen on a node from a client address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineReport {
    pub subscription_id: i64,
    pub ip: String,
}

#[derive(Debug, Default)]
pub struct OnlineTrackerMetrics {
    pub reports: AtomicU64,
    pub dropped_reports: AtomicU64,
}

pub struct OnlineTracker {
    store: Arc<dyn FastStore>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
    metrics: OnlineTrackerMetrics,
}

impl OnlineTracker {
    pub fn new(store: Arc<dyn FastStore>, clock: Arc<dyn Clock>, threshold: Duration) -> Self {
        Self {
            store,
            clock,
            threshold,
            metrics: OnlineTrackerMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &OnlineTrackerMetrics {
        &self.metrics
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> f64 {
        unix_score(now) - self.threshold.as_secs_f64()
    }

    /// Records what `node_id` currently sees, in one round trip.
    pub async fn update_online_subscriptions(
        &self,
        node_id: i64,
        reports: &[OnlineReport],
    ) -> Result<(), Error> {
        let now = self.clock.now();
        let score = unix_score(now);
        let cutoff = self.stale_cutoff(now);

        let mut devices: HashMap<i64, BTreeSet<&str>> = HashMap::new();
        for report in reports {
            if report.subscription_id <= 0 || report.ip.is_empty() {
                self.metrics.dropped_reports.fetch_add(1, Ordering::Relaxed);
                debug!(node_id, subscription_id = report.subscription_id, "Dropping malformed online report");
                continue;
            }
            devices
                .entry(report.subscription_id)
                .or_default()
                .insert(report.ip.as_str());
        }
        if devices.is_empty() {
            return Ok(());
        }

        let mut commands = Vec::new();
        let node_key = node_online_key(node_id);
        commands.push(Command::ZRemRangeByScore {
            key: node_key.clone(),
            max: cutoff,
        });
        let mut subscription_ids: Vec<i64> = devices.keys().copied().collect();
        subscription_ids.sort_unstable();
        for subscription_id in &subscription_ids {
            commands.push(Command::ZAdd {
                key: node_key.clone(),
                member: subscription_id.to_string(),
                score,
            });
        }
        commands.push(Command::Expire {
            key: node_key,
            ttl: self.threshold,
        });

        for subscription_id in subscription_ids {
            let key = device_online_key(subscription_id);
            commands.push(Command::ZRemRangeByScore {
                key: key.clone(),
                max: cutoff,
            });
            for ip in devices.get(&subscription_id).into_iter().flatten() {
                commands.push(Command::ZAdd {
                    key: key.clone(),
                    member: (*ip).to_string(),
                    score,
                });
            }
            commands.push(Command::Expire {
                key,
                ttl: self.threshold,
            });
        }

        self.store.pipeline(&commands).await?;
        self.metrics
            .reports
            .fetch_add(reports.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub async fn get_online_device_count(&self, subscription_id: i64) -> Result<u64, Error> {
        let counts = self
            .count_members(&[device_online_key(subscription_id)])
            .await?;
        Ok(counts.into_iter().next().unwrap_or(0))
    }

    pub async fn get_online_device_counts(&self, subscription_ids: &[i64]) -> Result<HashMap<i64, u64>, Error> {
        let keys: Vec<String> = subscription_ids.iter().map(|id| device_online_key(*id)).collect();
        let counts = self.count_members(&keys).await?;
        Ok(subscription_ids.iter().copied().zip(counts).collect())
    }

    pub async fn get_node_online_subscription_count(&self, node_id: i64) -> Result<u64, Error> {
        let counts = self.count_members(&[node_online_key(node_id)]).await?;
        Ok(counts.into_iter().next().unwrap_or(0))
    }

    pub async fn get_node_online_subscription_counts(&self, node_ids: &[i64]) -> Result<HashMap<i64, u64>, Error> {
        let keys: Vec<String> = node_ids.iter().map(|id| node_online_key(*id)).collect();
        let counts = self.count_members(&keys).await?;
        Ok(node_ids.iter().copied().zip(counts).collect())
    }

    /// Client addresses seen for `subscription_id` within the threshold, oldest first.
    pub async fn online_devices(&self, subscription_id: i64) -> Result<Vec<String>, Error> {
        let now = self.clock.now();
        let cutoff = self.stale_cutoff(now);
        let key = device_online_key(subscription_id);
        let mut replies = self
            .store
            .pipeline(&[
                Command::ZRemRangeByScore {
                    key: key.clone(),
                    max: cutoff,
                },
                Command::ZRangeByScore { key, min: cutoff },
            ])
            .await?;
        match replies.pop() {
            Some(reply) => reply.into_members(),
            None => Ok(Vec::new()),
        }
    }

    /// Prunes every key in one round trip, then counts every key in another.
    async fn count_members(&self, keys: &[String]) -> Result<Vec<u64>, Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff = self.stale_cutoff(self.clock.now());
        let prunes: Vec<Command> = keys
            .iter()
            .map(|key| Command::ZRemRangeByScore {
                key: key.clone(),
                max: cutoff,
            })
            .collect();
        self.store.pipeline(&prunes).await?;

        let cards: Vec<Command> = keys
            .iter()
            .map(|key| Command::ZCard { key: key.clone() })
            .collect();
        self.store
            .pipeline(&cards)
            .await?
            .into_iter()
            .map(|reply| reply.into_int().map(|n| u64::try_from(n).unwrap_or(0)))
            .collect()
    }
}

/// Live status field maps at `{entity}:{id}:status`, kept for [`STATUS_TTL`]
/// after the last report.
pub struct StatusRegistry {
    store: Arc<dyn FastStore>,
    clock: Arc<dyn Clock>,
}

impl StatusRegistry {
    pub fn new(store: Arc<dyn FastStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn status_key(entity: &str, id: i64) -> String {
        format!("{entity}:{id}:status")
    }

    pub async fn report(&self, entity: &str, id: i64, fields: &[(&str, String)]) -> Result<(), Error> {
        let key = Self::status_key(entity, id);
        let mut values: Vec<(String, String)> = fields
            .iter()
            .map(|(field, value)| ((*field).to_string(), value.clone()))
            .collect();
        values.push((
            "last_seen".to_string(),
            self.clock.now().timestamp().to_string(),
        ));
        self.store
            .pipeline(&[
                Command::HSet {
                    key: key.clone(),
                    fields: values,
                },
                Command::Expire {
                    key,
                    ttl: STATUS_TTL,
                },
            ])
            .await?;
        Ok(())
    }

    pub async fn get(&self, entity: &str, id: i64) -> Result<Option<HashMap<String, String>>, Error> {
        let status = self.store.hgetall(&Self::status_key(entity, id)).await?;
        Ok((!status.is_empty()).then_some(status))
    }

    pub async fn is_online(&self, entity: &str, id: i64) -> Result<bool, Error> {
        Ok(self.get(entity, id).await?.is_some())
    }

    /// The subset of `ids` without a live status, in input order.
    pub async fn offline_among(&self, entity: &str, ids: &[i64]) -> Result<Vec<i64>, Error> {
        let reads: Vec<Command> = ids
            .iter()
            .map(|id| Command::HGetAll {
                key: Self::status_key(entity, *id),
            })
            .collect();
        let replies = self.store.pipeline(&reads).await?;
        let mut offline = Vec::new();
        for (id, reply) in ids.iter().zip(replies) {
            if reply.into_hash()?.is_empty() {
                offline.push(*id);
            }
        }
        Ok(offline)
    }
}
