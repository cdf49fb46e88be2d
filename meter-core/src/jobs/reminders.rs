//! Offline-resource alerts, expiry reminders and periodic digests.
//!
//! Digests run hourly and pick their recipients by preferred local hour (and
//! weekday for weekly digests) instead of scheduling one job per recipient.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::durable::Subscription;
use crate::error::Error;
use crate::online::StatusRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestFrequency {
    Daily,
    Weekly(Weekday),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRecipient {
    pub recipient_id: i64,
    /// Business-local hour, 0..=23
    pub preferred_hour: u32,
    pub frequency: DigestFrequency,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    ResourceOffline {
        entity: String,
        id: i64,
    },
    SubscriptionExpiring {
        subscription_id: i64,
        user_id: i64,
        end_at: DateTime<Utc>,
    },
    Digest {
        recipient_id: i64,
        frequency: DigestFrequency,
    },
}

/// Delivery channel (chat bot, email, ...). Delivery itself lives outside
/// the metering core.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: Notice) -> Result<(), Error>;
}

/// Who and what the reminder jobs look at.
#[async_trait]
pub trait ReminderSource: Send + Sync {
    /// IDs of nodes whose liveness is monitored.
    async fn monitored_nodes(&self) -> Result<Vec<i64>, Error>;

    /// Active subscriptions ending in `[now, now + within)`.
    async fn expiring_subscriptions(
        &self,
        now: DateTime<Utc>,
        within: Duration,
    ) -> Result<Vec<Subscription>, Error>;

    async fn digest_recipients(&self) -> Result<Vec<DigestRecipient>, Error>;
}

/// Recipients whose digest is due in the business-local hour containing `now`.
pub fn due_recipients(
    recipients: &[DigestRecipient],
    timezone: Tz,
    now: DateTime<Utc>,
) -> Vec<&DigestRecipient> {
    let local = now.with_timezone(&timezone);
    recipients
        .iter()
        .filter(|recipient| recipient.preferred_hour == local.hour())
        .filter(|recipient| match recipient.frequency {
            DigestFrequency::Daily => true,
            DigestFrequency::Weekly(weekday) => weekday == local.weekday(),
        })
        .collect()
}

impl Notice {
    fn kind(&self) -> &'static str {
        match self {
            Notice::ResourceOffline { .. } => "resource_offline",
            Notice::SubscriptionExpiring { .. } => "subscription_expiring",
            Notice::Digest { .. } => "digest",
        }
    }
}

/// Outcome of one reminder pass.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
    first_error: Option<Error>,
}

impl DeliveryReport {
    /// The first delivery failure, if any, so the run is recorded as failed.
    pub fn into_result(self) -> Result<(), Error> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub const NODE_ENTITY: &str = "node";

pub struct ReminderJobs {
    source: Arc<dyn ReminderSource>,
    status: Arc<StatusRegistry>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    expiring_window: Duration,
}

impl ReminderJobs {
    pub fn new(
        source: Arc<dyn ReminderSource>,
        status: Arc<StatusRegistry>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        timezone: Tz,
        expiring_window: Duration,
    ) -> Self {
        Self {
            source,
            status,
            notifier,
            clock,
            timezone,
            expiring_window,
        }
    }

    /// Hands every notice to the notifier. A failed delivery is logged and
    /// counted; the remaining notices are still delivered.
    async fn deliver(&self, notices: Vec<Notice>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for notice in notices {
            let kind = notice.kind();
            match self.notifier.notify(notice).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!(kind, "Failed to deliver notice: {e}");
                    metrics::counter!("meter_notice_failures_total", "kind" => kind).increment(1);
                    report.failed += 1;
                    report.first_error.get_or_insert(e);
                }
            }
        }
        report
    }

    /// Notifies about every monitored node without a live status.
    pub async fn check_offline(&self) -> Result<DeliveryReport, Error> {
        let nodes = self.source.monitored_nodes().await?;
        if nodes.is_empty() {
            return Ok(DeliveryReport::default());
        }
        let offline = self.status.offline_among(NODE_ENTITY, &nodes).await?;
        let notices = offline
            .iter()
            .map(|id| Notice::ResourceOffline {
                entity: NODE_ENTITY.to_string(),
                id: *id,
            })
            .collect();
        let report = self.deliver(notices).await;
        if !offline.is_empty() {
            info!(
                offline = offline.len(),
                monitored = nodes.len(),
                failed = report.failed,
                "Offline nodes reported"
            );
        }
        Ok(report)
    }

    pub async fn check_expiring(&self) -> Result<DeliveryReport, Error> {
        let now = self.clock.now();
        let expiring = self
            .source
            .expiring_subscriptions(now, self.expiring_window)
            .await?;
        let notices = expiring
            .into_iter()
            .filter_map(|subscription| {
                Some(Notice::SubscriptionExpiring {
                    subscription_id: subscription.id,
                    user_id: subscription.user_id,
                    end_at: subscription.end_at?,
                })
            })
            .collect();
        let report = self.deliver(notices).await;
        debug!(sent = report.sent, failed = report.failed, "Expiry reminders sent");
        Ok(report)
    }

    pub async fn send_digests(&self) -> Result<DeliveryReport, Error> {
        let recipients = self.source.digest_recipients().await?;
        let notices = due_recipients(&recipients, self.timezone, self.clock.now())
            .into_iter()
            .map(|recipient| Notice::Digest {
                recipient_id: recipient.recipient_id,
                frequency: recipient.frequency,
            })
            .collect();
        let report = self.deliver(notices).await;
        debug!(
            sent = report.sent,
            failed = report.failed,
            total = recipients.len(),
            "Digests sent"
        );
        Ok(report)
    }
}
