use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::{has_quota_remaining, QuotaCache};
use crate::traffic::UsageReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No active subscription with this ID
    NotFound,
    Suspended,
    Exhausted { used: u64, limit: u64 },
    /// Quota or usage could not be determined
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// `remaining` is `None` for unlimited plans and when admitted fail-open.
    Allow { remaining: Option<u64> },
    Deny { reason: DenyReason },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allow { .. })
    }
}

/// Connection admission: quota lookup, then current-period usage, then the
/// limit comparison.
///
/// When the quota or usage cannot be determined the check denies unless
/// `fail_open` is set. Denying keeps a backend outage from turning into
/// unmetered service.
pub struct QuotaEnforcer {
    quotas: Arc<QuotaCache>,
    usage: Arc<UsageReader>,
    fail_open: bool,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl QuotaEnforcer {
    pub fn new(quotas: Arc<QuotaCache>, usage: Arc<UsageReader>, fail_open: bool) -> Self {
        Self {
            quotas,
            usage,
            fail_open,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub async fn check(&self, subscription_id: i64) -> QuotaDecision {
        let decision = self.decide(subscription_id).await;
        match decision {
            QuotaDecision::Allow { .. } => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("meter_quota_checks_total", "decision" => "allow").increment(1);
            }
            QuotaDecision::Deny { reason } => {
                self.denied.fetch_add(1, Ordering::Relaxed);
                let label = match reason {
                    DenyReason::NotFound => "not_found",
                    DenyReason::Suspended => "suspended",
                    DenyReason::Exhausted { .. } => "exhausted",
                    DenyReason::Unavailable => "unavailable",
                };
                metrics::counter!("meter_quota_checks_total", "decision" => label).increment(1);
            }
        }
        decision
    }

    pub fn allowed_count(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn denied_count(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    async fn decide(&self, subscription_id: i64) -> QuotaDecision {
        let entry = match self.quotas.get_or_load(subscription_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return QuotaDecision::Deny {
                    reason: DenyReason::NotFound,
                }
            }
            Err(e) => return self.undetermined(subscription_id, &e),
        };
        if entry.suspended {
            return QuotaDecision::Deny {
                reason: DenyReason::Suspended,
            };
        }
        if entry.limit == 0 {
            return QuotaDecision::Allow { remaining: None };
        }

        let used = match self
            .usage
            .get_current_period_usage(
                subscription_id,
                entry.plan_type,
                entry.period_start,
                entry.period_end,
            )
            .await
        {
            Ok(used) => used,
            Err(e) => return self.undetermined(subscription_id, &e),
        };

        if has_quota_remaining(used, entry.limit) {
            QuotaDecision::Allow {
                remaining: Some(entry.limit - used),
            }
        } else {
            QuotaDecision::Deny {
                reason: DenyReason::Exhausted {
                    used,
                    limit: entry.limit,
                },
            }
        }
    }

    fn undetermined(&self, subscription_id: i64, error: &crate::error::Error) -> QuotaDecision {
        if self.fail_open {
            warn!(subscription_id, "Quota undetermined, admitting (fail-open): {error}");
            QuotaDecision::Allow { remaining: None }
        } else {
            warn!(subscription_id, "Quota undetermined, denying (fail-closed): {error}");
            QuotaDecision::Deny {
                reason: DenyReason::Unavailable,
            }
        }
    }
}
