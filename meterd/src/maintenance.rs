//! Durable-store backed collaborators for the maintenance jobs.
//!
//! The billing tables belong to the billing service and are never created
//! here. Columns read or written:
//! - `payments(subscription_id, status, expires_at)`
//! - `subscriptions(id, status, created_at)`
//! - `nodes(id, sid, enabled)`
//! - `admin_notification_settings(user_id, digest_enabled, digest_hour, digest_weekday)`,
//!   where `digest_weekday` is ISO numbered and NULL means daily

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc, Weekday};
use sqlx::PgPool;
use tracing::info;

use meter_core::durable::{Subscription, SubscriptionRepository};
use meter_core::error::{Error, ErrorDetails};
use meter_core::jobs::{
    DigestFrequency, DigestRecipient, Notice, Notifier, PaymentMaintenance, ReminderSource,
};
use meter_core::metadata_cache::{CachedDirectory, MetadataItem, MetadataSource};

pub struct PgPaymentMaintenance {
    pool: PgPool,
    unpaid_grace: Duration,
}

impl PgPaymentMaintenance {
    pub fn new(pool: PgPool, unpaid_grace: Duration) -> Self {
        Self { pool, unpaid_grace }
    }
}

#[async_trait]
impl PaymentMaintenance for PgPaymentMaintenance {
    async fn expire_stale_payments(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE payments SET status = 'expired' \
             WHERE status = 'pending' AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cancel_unpaid_subscriptions(&self) -> Result<u64, Error> {
        let grace_secs = i64::try_from(self.unpaid_grace.as_secs()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'cancelled' \
             WHERE status = 'pending_payment' \
               AND created_at <= now() - make_interval(secs => $1::double precision)",
        )
        .bind(grace_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn retry_failed_activations(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE subscriptions s SET status = 'active' \
             FROM payments p \
             WHERE p.subscription_id = s.id AND p.status = 'paid' \
               AND s.status = 'pending_payment'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: i64,
    pub sid: String,
}

impl MetadataItem for NodeRecord {
    fn id(&self) -> i64 {
        self.id
    }

    fn sid(&self) -> &str {
        &self.sid
    }
}

pub struct PgNodeSource {
    pool: PgPool,
}

impl PgNodeSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataSource<NodeRecord> for PgNodeSource {
    async fn load_all(&self) -> Result<Vec<NodeRecord>, Error> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, sid FROM nodes WHERE enabled ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, sid)| NodeRecord { id, sid })
            .collect())
    }
}

pub struct PgReminderSource {
    pool: PgPool,
    nodes: Arc<CachedDirectory<NodeRecord>>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl PgReminderSource {
    pub fn new(
        pool: PgPool,
        nodes: Arc<CachedDirectory<NodeRecord>>,
        subscriptions: Arc<dyn SubscriptionRepository>,
    ) -> Self {
        Self {
            pool,
            nodes,
            subscriptions,
        }
    }
}

fn parse_weekday(value: Option<i16>) -> Option<Weekday> {
    // ISO numbering, Monday = 1
    let value = u8::try_from(value?).ok()?;
    Weekday::try_from(value.checked_sub(1)?).ok()
}

#[async_trait]
impl ReminderSource for PgReminderSource {
    /// Served from the node directory, which rescans `nodes` once per metadata TTL.
    async fn monitored_nodes(&self) -> Result<Vec<i64>, Error> {
        Ok(self.nodes.resolve::<&str>(None).await.ids)
    }

    async fn expiring_subscriptions(
        &self,
        now: DateTime<Utc>,
        within: Duration,
    ) -> Result<Vec<Subscription>, Error> {
        let window = chrono::Duration::from_std(within).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Expiry reminder window out of range: {e}"),
            })
        })?;
        self.subscriptions
            .find_ending_between(now, now + window)
            .await
    }

    async fn digest_recipients(&self) -> Result<Vec<DigestRecipient>, Error> {
        let rows = sqlx::query_as::<_, (i64, i16, Option<i16>)>(
            "SELECT user_id, digest_hour, digest_weekday FROM admin_notification_settings \
             WHERE digest_enabled",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(recipient_id, hour, weekday)| {
                let preferred_hour = u32::try_from(hour).ok().filter(|h| *h < 24)?;
                let frequency = match weekday {
                    None => DigestFrequency::Daily,
                    Some(_) => DigestFrequency::Weekly(parse_weekday(weekday)?),
                };
                Some(DigestRecipient {
                    recipient_id,
                    preferred_hour,
                    frequency,
                })
            })
            .collect())
    }
}

/// Hands notices to the log. Delivery channels subscribe to these events.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: Notice) -> Result<(), Error> {
        match notice {
            Notice::ResourceOffline { entity, id } => {
                info!(%entity, id, "Resource offline");
            }
            Notice::SubscriptionExpiring {
                subscription_id,
                user_id,
                end_at,
            } => {
                info!(subscription_id, user_id, %end_at, "Subscription expiring soon");
            }
            Notice::Digest {
                recipient_id,
                frequency,
            } => {
                info!(recipient_id, ?frequency, "Digest due");
            }
        }
        Ok(())
    }
}

/// Stand-in for `--dry-run`, where no billing tables exist.
pub struct Inert;

#[async_trait]
impl PaymentMaintenance for Inert {
    async fn expire_stale_payments(&self) -> Result<u64, Error> {
        Ok(0)
    }

    async fn cancel_unpaid_subscriptions(&self) -> Result<u64, Error> {
        Ok(0)
    }

    async fn retry_failed_activations(&self) -> Result<u64, Error> {
        Ok(0)
    }
}

#[async_trait]
impl ReminderSource for Inert {
    async fn monitored_nodes(&self) -> Result<Vec<i64>, Error> {
        Ok(Vec::new())
    }

    async fn expiring_subscriptions(
        &self,
        _now: DateTime<Utc>,
        _within: Duration,
    ) -> Result<Vec<Subscription>, Error> {
        Ok(Vec::new())
    }

    async fn digest_recipients(&self) -> Result<Vec<DigestRecipient>, Error> {
        Ok(Vec::new())
    }
}
