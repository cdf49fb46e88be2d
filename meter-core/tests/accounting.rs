//! End-to-end accounting scenarios against the in-memory stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use meter_core::clock::ManualClock;
use meter_core::config::CacheConfig;
use meter_core::durable::{
    MemorySubscriptionRepository, MemoryUsageRepository, Plan, PlanType, ResourceType,
    Subscription, SubscriptionStatus, UsageTotals,
};
use meter_core::fast_store::MemoryFastStore;
use meter_core::online::{OnlineReport, OnlineTracker};
use meter_core::quota::{DenyReason, QuotaCache, QuotaDecision, QuotaEnforcer};
use meter_core::scheduler::{handler, JobSpec, SchedulerManager, Trigger, TriggerOutcome};
use meter_core::traffic::{TrafficBuffer, UsageReader};

const GB: u64 = 1 << 30;
const SUBSCRIPTION: i64 = 1;
const NODE: i64 = 7;

fn shanghai(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    chrono_tz::Asia::Shanghai
        .with_ymd_and_hms(y, m, d, h, min, 0)
        .unwrap()
        .with_timezone(&Utc)
}

struct World {
    clock: Arc<ManualClock>,
    store: Arc<MemoryFastStore>,
    subscriptions: Arc<MemorySubscriptionRepository>,
    usage: Arc<MemoryUsageRepository>,
    buffer: TrafficBuffer,
    reader: Arc<UsageReader>,
}

impl World {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(shanghai(2025, 1, 20, 12, 30)));
        let store = Arc::new(MemoryFastStore::new(clock.clone()));
        let subscriptions = Arc::new(MemorySubscriptionRepository::new());
        let usage = Arc::new(MemoryUsageRepository::new());

        subscriptions.insert_plan(Plan {
            id: 100,
            plan_type: PlanType::Node,
            traffic_limit: 100 * GB,
        });
        subscriptions.insert_subscription(Subscription {
            id: SUBSCRIPTION,
            sid: "sub_abc".to_string(),
            user_id: 9,
            plan_id: 100,
            status: SubscriptionStatus::Active,
            current_period_start: shanghai(2025, 1, 1, 0, 0),
            current_period_end: shanghai(2025, 2, 1, 0, 0),
            end_at: Some(shanghai(2025, 6, 1, 0, 0)),
        });

        let buffer = TrafficBuffer::new(
            store.clone(),
            usage.clone(),
            clock.clone(),
            Duration::from_secs(50 * 3600),
        );
        let reader = Arc::new(UsageReader::new(
            store.clone(),
            usage.clone(),
            clock.clone(),
            chrono_tz::Asia::Shanghai,
            Duration::from_secs(3),
        ));
        Self {
            clock,
            store,
            subscriptions,
            usage,
            buffer,
            reader,
        }
    }

    fn quota_cache(&self) -> Arc<QuotaCache> {
        Arc::new(QuotaCache::new(
            self.store.clone(),
            self.subscriptions.clone(),
            self.clock.clone(),
            &CacheConfig::default(),
        ))
    }

    fn enforcer(&self, fail_open: bool) -> QuotaEnforcer {
        QuotaEnforcer::new(self.quota_cache(), self.reader.clone(), fail_open)
    }
}

#[tokio::test]
async fn test_recent_and_historical_usage_exhaust_quota() {
    let world = World::new();
    world.usage.insert_daily(
        ResourceType::Node,
        NODE,
        Some(SUBSCRIPTION),
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
        UsageTotals::new(10 * GB, 60 * GB),
    );
    let enforcer = world.enforcer(false);

    assert_eq!(
        enforcer.check(SUBSCRIPTION).await,
        QuotaDecision::Allow {
            remaining: Some(30 * GB)
        }
    );

    world
        .buffer
        .add_traffic(NODE, SUBSCRIPTION, 5 * GB, 30 * GB)
        .await
        .unwrap();

    assert_eq!(
        enforcer.check(SUBSCRIPTION).await,
        QuotaDecision::Deny {
            reason: DenyReason::Exhausted {
                used: 105 * GB,
                limit: 100 * GB
            }
        }
    );
    assert_eq!(enforcer.allowed_count(), 1);
    assert_eq!(enforcer.denied_count(), 1);
}

#[tokio::test]
async fn test_fold_does_not_double_count() {
    let world = World::new();
    world.usage.insert_daily(
        ResourceType::Node,
        NODE,
        Some(SUBSCRIPTION),
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
        UsageTotals::new(0, 70 * GB),
    );
    world
        .buffer
        .add_traffic(NODE, SUBSCRIPTION, 0, 35 * GB)
        .await
        .unwrap();
    let period = (shanghai(2025, 1, 1, 0, 0), shanghai(2025, 2, 1, 0, 0));

    let before = world
        .reader
        .breakdown(SUBSCRIPTION, PlanType::Node, period.0, period.1)
        .await
        .unwrap();
    assert_eq!(before.total(), 105 * GB);

    let first = world.buffer.fold().await.unwrap();
    assert_eq!(first.records_written, 1);
    let second = world.buffer.fold().await.unwrap();
    assert_eq!(second.records_written, 0);
    assert_eq!(world.usage.hourly_total(SUBSCRIPTION), UsageTotals::new(0, 35 * GB));

    let after = world
        .reader
        .breakdown(SUBSCRIPTION, PlanType::Node, period.0, period.1)
        .await
        .unwrap();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_unknown_subscription_hits_database_once() {
    let world = World::new();
    let enforcer = world.enforcer(false);

    for _ in 0..50 {
        assert_eq!(
            enforcer.check(999_999).await,
            QuotaDecision::Deny {
                reason: DenyReason::NotFound
            }
        );
    }
    assert_eq!(world.subscriptions.query_count(), 1);
}

#[tokio::test]
async fn test_ended_subscription_is_denied_before_the_sweep() {
    let world = World::new();
    world.subscriptions.insert_subscription(Subscription {
        id: 2,
        sid: "sub_ended".to_string(),
        user_id: 9,
        plan_id: 100,
        status: SubscriptionStatus::Active,
        current_period_start: shanghai(2025, 1, 1, 0, 0),
        current_period_end: shanghai(2025, 2, 1, 0, 0),
        end_at: Some(shanghai(2025, 1, 15, 0, 0)),
    });

    assert_eq!(
        world.enforcer(false).check(2).await,
        QuotaDecision::Deny {
            reason: DenyReason::NotFound
        }
    );
}

#[tokio::test]
async fn test_suspension_takes_effect_without_reload() {
    let world = World::new();
    let quotas = world.quota_cache();
    let enforcer = QuotaEnforcer::new(quotas.clone(), world.reader.clone(), false);
    assert!(enforcer.check(SUBSCRIPTION).await.is_allowed());

    assert!(quotas.mark_suspended(SUBSCRIPTION).await.unwrap());
    assert!(!quotas.mark_suspended(SUBSCRIPTION).await.unwrap());
    assert_eq!(
        enforcer.check(SUBSCRIPTION).await,
        QuotaDecision::Deny {
            reason: DenyReason::Suspended
        }
    );
    assert_eq!(world.subscriptions.query_count(), 1);
}

#[tokio::test]
async fn test_backend_outage_fails_closed_unless_configured_open() {
    let world = World::new();
    world.store.set_failing(true);
    world.subscriptions.set_failing(true);

    assert_eq!(
        world.enforcer(false).check(SUBSCRIPTION).await,
        QuotaDecision::Deny {
            reason: DenyReason::Unavailable
        }
    );
    assert_eq!(
        world.enforcer(true).check(SUBSCRIPTION).await,
        QuotaDecision::Allow { remaining: None }
    );
}

#[tokio::test]
async fn test_stale_devices_are_evicted() {
    let world = World::new();
    let tracker = OnlineTracker::new(
        world.store.clone(),
        world.clock.clone(),
        Duration::from_secs(300),
    );
    tracker
        .update_online_subscriptions(
            NODE,
            &[OnlineReport {
                subscription_id: SUBSCRIPTION,
                ip: "203.0.113.5".to_string(),
            }],
        )
        .await
        .unwrap();

    world.clock.advance(chrono::Duration::minutes(4));
    assert_eq!(tracker.get_online_device_count(SUBSCRIPTION).await.unwrap(), 1);
    assert_eq!(
        tracker.get_node_online_subscription_count(NODE).await.unwrap(),
        1
    );

    world.clock.advance(chrono::Duration::minutes(2));
    assert_eq!(tracker.get_online_device_count(SUBSCRIPTION).await.unwrap(), 0);
    assert_eq!(
        tracker.get_node_online_subscription_count(NODE).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_singleton_job_never_overlaps() {
    let scheduler = SchedulerManager::new(chrono_tz::Asia::Shanghai, Arc::new(ManualClock::new(Utc::now())));
    let gate = CancellationToken::new();
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (g, c, p) = (gate.clone(), concurrent.clone(), peak.clone());
    scheduler
        .register(JobSpec::new(
            "usage_daily_rollup",
            Trigger::cron("0 0 1 * * *").unwrap(),
            handler(move |_ctx| {
                let (g, c, p) = (g.clone(), c.clone(), p.clone());
                async move {
                    p.fetch_max(c.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
                    g.cancelled().await;
                    c.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ))
        .unwrap();
    scheduler.start().unwrap();

    assert_eq!(
        scheduler.trigger("usage_daily_rollup").unwrap(),
        TriggerOutcome::Started
    );
    assert_eq!(
        scheduler.trigger("usage_daily_rollup").unwrap(),
        TriggerOutcome::Rescheduled
    );
    gate.cancel();
    scheduler.stop(Duration::from_secs(5)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.stats("usage_daily_rollup").unwrap().runs, 1);
}
