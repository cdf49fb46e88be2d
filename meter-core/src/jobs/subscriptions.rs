use tracing::info;

use crate::clock::Clock;
use crate::durable::SubscriptionRepository;
use crate::error::Error;

/// Stores `expired` on subscriptions past their end date.
///
/// Admission does not wait for this: it computes the effective status itself.
/// The sweep keeps stored status accurate for reporting.
pub async fn sweep_expired_subscriptions(
    repo: &dyn SubscriptionRepository,
    clock: &dyn Clock,
) -> Result<u64, Error> {
    let expired = repo.mark_expired(clock.now()).await?;
    if expired > 0 {
        info!(expired, "Marked ended subscriptions as expired");
    }
    Ok(expired)
}
