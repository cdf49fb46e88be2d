use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::{
    parse_counter, parse_pending_field, parse_pending_key, pending_field, pending_key,
    saturating_i64, usage_key, TrafficDelta, DOWNLOAD_FIELD, PENDING_SET_KEY, UPLOAD_FIELD,
};
use crate::calendar::hour_bucket;
use crate::clock::Clock;
use crate::durable::{ResourceType, UsageRecord, UsageRepository};
use crate::error::Error;
use crate::fast_store::{Command, FastStore};

/// Pending hashes for an hour that ended this long ago are retired once drained.
const CLOSED_HOUR_GRACE: chrono::Duration = chrono::Duration::minutes(5);

#[derive(Debug, Default)]
pub struct TrafficBufferMetrics {
    pub deltas_recorded: AtomicU64,
    pub deltas_dropped: AtomicU64,
    pub folds: AtomicU64,
    pub fold_failures: AtomicU64,
    pub bytes_folded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldReport {
    pub keys_scanned: usize,
    pub records_written: usize,
    pub bytes_folded: u64,
    pub keys_retired: usize,
}

pub struct TrafficBuffer {
    store: Arc<dyn FastStore>,
    repo: Arc<dyn UsageRepository>,
    clock: Arc<dyn Clock>,
    counter_ttl: Duration,
    metrics: TrafficBufferMetrics,
}

impl TrafficBuffer {
    pub fn new(
        store: Arc<dyn FastStore>,
        repo: Arc<dyn UsageRepository>,
        clock: Arc<dyn Clock>,
        counter_ttl: Duration,
    ) -> Self {
        Self {
            store,
            repo,
            clock,
            counter_ttl,
            metrics: TrafficBufferMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &TrafficBufferMetrics {
        &self.metrics
    }

    /// Records node traffic for the current hour.
    pub async fn add_traffic(
        &self,
        node_id: i64,
        subscription_id: i64,
        upload: u64,
        download: u64,
    ) -> Result<(), Error> {
        self.add_resource_traffic(
            ResourceType::Node,
            node_id,
            &[TrafficDelta::new(subscription_id, upload, download)],
        )
        .await
    }

    /// Records a batch of deltas reported by one node in a single round trip.
    pub async fn add_traffic_batch(&self, node_id: i64, deltas: &[TrafficDelta]) -> Result<(), Error> {
        self.add_resource_traffic(ResourceType::Node, node_id, deltas)
            .await
    }

    /// Records deltas against any metered resource. Zero and unattributed
    /// deltas are dropped without error.
    pub async fn add_resource_traffic(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
        deltas: &[TrafficDelta],
    ) -> Result<(), Error> {
        let hour = hour_bucket(self.clock.now());
        let pending = pending_key(resource_type, resource_id, hour);
        let mut commands = Vec::new();
        let mut recorded = 0u64;

        for delta in deltas {
            if !delta.is_countable() {
                self.metrics.deltas_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    resource_id,
                    subscription_id = delta.subscription_id,
                    "Dropping traffic delta without attribution or bytes"
                );
                continue;
            }
            let usage = usage_key(resource_type, delta.subscription_id, hour);
            for (direction, bytes) in [(UPLOAD_FIELD, delta.upload), (DOWNLOAD_FIELD, delta.download)] {
                if bytes == 0 {
                    continue;
                }
                commands.push(Command::HIncrBy {
                    key: usage.clone(),
                    field: direction.to_string(),
                    delta: saturating_i64(bytes),
                });
                commands.push(Command::HIncrBy {
                    key: pending.clone(),
                    field: pending_field(delta.subscription_id, direction),
                    delta: saturating_i64(bytes),
                });
            }
            commands.push(Command::Expire {
                key: usage,
                ttl: self.counter_ttl,
            });
            recorded += 1;
        }

        if commands.is_empty() {
            return Ok(());
        }
        commands.push(Command::Expire {
            key: pending.clone(),
            ttl: self.counter_ttl,
        });
        commands.push(Command::SAdd {
            key: PENDING_SET_KEY.to_string(),
            member: pending,
        });

        self.store.pipeline(&commands).await?;
        self.metrics
            .deltas_recorded
            .fetch_add(recorded, Ordering::Relaxed);
        metrics::counter!("meter_traffic_deltas_total", "resource_type" => resource_type.as_ref().to_string())
            .increment(recorded);
        Ok(())
    }

    /// Moves accumulated pending counters into durable hourly rows.
    ///
    /// Counters are decremented by exactly the amounts written, so increments
    /// racing with the fold survive for the next one, and a second fold over
    /// the same data finds nothing left to write. If the durable write fails no
    /// counter is touched and the next fold retries.
    #[instrument(skip(self))]
    pub async fn fold(&self) -> Result<FoldReport, Error> {
        let result = self.fold_inner().await;
        match &result {
            Ok(report) => {
                self.metrics.folds.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .bytes_folded
                    .fetch_add(report.bytes_folded, Ordering::Relaxed);
                metrics::counter!("meter_traffic_bytes_folded_total").increment(report.bytes_folded);
            }
            Err(_) => {
                self.metrics.fold_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("meter_traffic_fold_failures_total").increment(1);
            }
        }
        result
    }

    async fn fold_inner(&self) -> Result<FoldReport, Error> {
        let now = self.clock.now();
        let members = self.store.smembers(PENDING_SET_KEY).await?;
        let mut report = FoldReport {
            keys_scanned: members.len(),
            ..FoldReport::default()
        };
        if members.is_empty() {
            return Ok(report);
        }

        let mut keys = Vec::with_capacity(members.len());
        let mut cleanup = Vec::new();
        for member in members {
            match parse_pending_key(&member) {
                Some((resource_type, resource_id, hour)) => {
                    keys.push((member, resource_type, resource_id, hour))
                }
                None => {
                    warn!(key = %member, "Removing unrecognised entry from pending traffic set");
                    cleanup.push(Command::SRem {
                        key: PENDING_SET_KEY.to_string(),
                        member,
                    });
                }
            }
        }

        let reads: Vec<Command> = keys
            .iter()
            .map(|(key, ..)| Command::HGetAll { key: key.clone() })
            .collect();
        let hashes = self.store.pipeline(&reads).await?;

        let mut records = Vec::new();
        let mut decrements = Vec::new();
        let mut drained_keys = Vec::new();
        for ((key, resource_type, resource_id, hour), reply) in keys.iter().zip(hashes) {
            let hash = reply.into_hash()?;
            let mut per_subscription: HashMap<i64, (u64, u64)> = HashMap::new();
            for (field, raw) in &hash {
                let Some((subscription_id, direction)) = parse_pending_field(field) else {
                    continue;
                };
                let bytes = parse_counter(raw);
                if bytes == 0 {
                    continue;
                }
                let entry = per_subscription.entry(subscription_id).or_default();
                if direction == UPLOAD_FIELD {
                    entry.0 = entry.0.saturating_add(bytes);
                } else {
                    entry.1 = entry.1.saturating_add(bytes);
                }
                decrements.push(Command::HIncrBy {
                    key: key.clone(),
                    field: field.clone(),
                    delta: -saturating_i64(bytes),
                });
            }
            for (subscription_id, (upload, download)) in per_subscription {
                report.bytes_folded = report.bytes_folded.saturating_add(upload).saturating_add(download);
                records.push(UsageRecord {
                    resource_type: *resource_type,
                    resource_id: *resource_id,
                    subscription_id: Some(subscription_id),
                    period_start: *hour,
                    upload,
                    download,
                });
            }
            if hour_is_closed(*hour, now) {
                drained_keys.push(key.clone());
            }
        }

        if !records.is_empty() {
            self.repo.upsert_hourly(&records).await?;
            report.records_written = records.len();
        }
        if !decrements.is_empty() {
            self.store.pipeline(&decrements).await?;
        }
        report.keys_retired = self.retire_drained(drained_keys, cleanup).await?;

        if report.records_written > 0 {
            info!(
                records = report.records_written,
                bytes = report.bytes_folded,
                "Folded pending traffic into hourly usage"
            );
        }
        Ok(report)
    }

    /// Removes pending hashes of closed hours whose counters are all zero.
    async fn retire_drained(&self, candidates: Vec<String>, mut commands: Vec<Command>) -> Result<usize, Error> {
        let mut retired = 0;
        if !candidates.is_empty() {
            let reads: Vec<Command> = candidates
                .iter()
                .map(|key| Command::HGetAll { key: key.clone() })
                .collect();
            let hashes = self.store.pipeline(&reads).await?;
            for (key, reply) in candidates.into_iter().zip(hashes) {
                let hash = reply.into_hash()?;
                if hash.values().all(|raw| parse_counter(raw) == 0) {
                    commands.push(Command::SRem {
                        key: PENDING_SET_KEY.to_string(),
                        member: key.clone(),
                    });
                    commands.push(Command::Del { key });
                    retired += 1;
                }
            }
        }
        if !commands.is_empty() {
            self.store.pipeline(&commands).await?;
        }
        Ok(retired)
    }
}

fn hour_is_closed(hour: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    hour + chrono::Duration::hours(1) + CLOSED_HOUR_GRACE <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::durable::{MemoryUsageRepository, UsageTotals};
    use crate::fast_store::MemoryFastStore;
    use chrono::TimeZone;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryFastStore>,
        repo: Arc<MemoryUsageRepository>,
        buffer: TrafficBuffer,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 20, 12, 10, 0).unwrap(),
        ));
        let store = Arc::new(MemoryFastStore::new(clock.clone()));
        let repo = Arc::new(MemoryUsageRepository::new());
        let buffer = TrafficBuffer::new(
            store.clone(),
            repo.clone(),
            clock.clone(),
            Duration::from_secs(50 * 3600),
        );
        Fixture {
            clock,
            store,
            repo,
            buffer,
        }
    }

    #[tokio::test]
    async fn test_batch_is_one_round_trip_and_drops_noise() {
        let f = fixture();
        f.buffer
            .add_traffic_batch(
                7,
                &[
                    TrafficDelta::new(1, 100, 200),
                    TrafficDelta::new(0, 100, 200),
                    TrafficDelta::new(2, 0, 0),
                    TrafficDelta::new(2, 5, 0),
                ],
            )
            .await
            .unwrap();
        assert_eq!(f.store.round_trips(), 1);
        assert_eq!(f.buffer.metrics().deltas_recorded.load(Ordering::Relaxed), 2);
        assert_eq!(f.buffer.metrics().deltas_dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_all_noise_skips_store() {
        let f = fixture();
        f.buffer.add_traffic(7, 0, 10, 10).await.unwrap();
        f.buffer.add_traffic(7, 3, 0, 0).await.unwrap();
        assert_eq!(f.store.round_trips(), 0);
    }

    #[tokio::test]
    async fn test_fold_twice_writes_once() {
        let f = fixture();
        f.buffer.add_traffic(7, 1, 100, 200).await.unwrap();
        f.buffer.add_traffic(7, 1, 1, 2).await.unwrap();
        f.buffer.add_traffic(8, 2, 10, 0).await.unwrap();

        let first = f.buffer.fold().await.unwrap();
        assert_eq!(first.records_written, 2);
        assert_eq!(first.bytes_folded, 313);
        let second = f.buffer.fold().await.unwrap();
        assert_eq!(second.records_written, 0);

        assert_eq!(f.repo.hourly_total(1), UsageTotals::new(101, 202));
        assert_eq!(f.repo.hourly_total(2), UsageTotals::new(10, 0));
    }

    #[tokio::test]
    async fn test_failed_upsert_keeps_counters() {
        let f = fixture();
        f.buffer.add_traffic(7, 1, 100, 0).await.unwrap();
        f.repo.set_failing(true);
        assert!(f.buffer.fold().await.is_err());
        f.repo.set_failing(false);

        let report = f.buffer.fold().await.unwrap();
        assert_eq!(report.bytes_folded, 100);
        assert_eq!(f.repo.hourly_total(1), UsageTotals::new(100, 0));
    }

    #[tokio::test]
    async fn test_closed_hour_is_retired() {
        let f = fixture();
        f.buffer.add_traffic(7, 1, 100, 0).await.unwrap();
        let hour = hour_bucket(f.clock.now());
        let key = pending_key(ResourceType::Node, 7, hour);

        f.buffer.fold().await.unwrap();
        assert!(f.store.contains_key(&key));

        f.clock.advance(chrono::Duration::hours(2));
        let report = f.buffer.fold().await.unwrap();
        assert_eq!(report.keys_retired, 1);
        assert!(!f.store.contains_key(&key));
        assert!(f.store.smembers(PENDING_SET_KEY).await.unwrap().is_empty());
    }
}
