//! The maintenance job families and their registration with the scheduler.

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::durable::SubscriptionRepository;
use crate::error::Error;
use crate::scheduler::{handler, JobSpec, SchedulerManager, Trigger};

pub mod payments;
pub mod reminders;
pub mod subscriptions;
pub mod usage;

pub use payments::{run_payment_maintenance, PaymentMaintenance, PaymentReport, PaymentStep};
pub use reminders::{
    due_recipients, DeliveryReport, DigestFrequency, DigestRecipient, Notice, Notifier,
    ReminderJobs, ReminderSource,
};
pub use subscriptions::sweep_expired_subscriptions;
pub use usage::{CleanupOutcome, RollupTracker, UsageJobs};

pub const PAYMENT_MAINTENANCE: &str = "payment_maintenance";
pub const SUBSCRIPTION_EXPIRY: &str = "subscription_expiry";
pub const TRAFFIC_FOLD: &str = "traffic_fold";
pub const USAGE_DAILY_ROLLUP: &str = "usage_daily_rollup";
pub const USAGE_MONTHLY_ROLLUP: &str = "usage_monthly_rollup";
pub const USAGE_CLEANUP: &str = "usage_cleanup";
pub const OFFLINE_CHECK: &str = "offline_check";
pub const EXPIRING_REMINDER: &str = "expiring_reminder";
pub const DIGEST: &str = "digest";

/// Everything the job handlers operate on.
pub struct JobDependencies {
    pub payments: Arc<dyn PaymentMaintenance>,
    pub subscriptions: Arc<dyn SubscriptionRepository>,
    pub usage: Arc<UsageJobs>,
    pub reminders: Arc<ReminderJobs>,
    pub clock: Arc<dyn Clock>,
}

/// Builds the job specs for every family.
pub fn job_specs(
    deps: &JobDependencies,
    config: &SchedulerConfig,
    fold_interval: std::time::Duration,
) -> Result<Vec<JobSpec>, Error> {
    let short = config.short_job_timeout();
    let long = config.long_job_timeout();
    let seconds = std::time::Duration::from_secs;

    let payments = Arc::clone(&deps.payments);
    let payment_job = JobSpec::new(
        PAYMENT_MAINTENANCE,
        Trigger::interval(seconds(config.payment_interval_secs), true),
        handler(move |_ctx| {
            let payments = Arc::clone(&payments);
            async move { run_payment_maintenance(payments.as_ref()).await.into_result() }
        }),
    )
    .timeout(short);

    let (subscriptions, clock) = (Arc::clone(&deps.subscriptions), Arc::clone(&deps.clock));
    let expiry_job = JobSpec::new(
        SUBSCRIPTION_EXPIRY,
        Trigger::interval(seconds(config.subscription_expiry_interval_secs), true),
        handler(move |_ctx| {
            let (subscriptions, clock) = (Arc::clone(&subscriptions), Arc::clone(&clock));
            async move {
                sweep_expired_subscriptions(subscriptions.as_ref(), clock.as_ref()).await?;
                Ok(())
            }
        }),
    )
    .timeout(long);

    let usage = Arc::clone(&deps.usage);
    let fold_job = JobSpec::new(
        TRAFFIC_FOLD,
        Trigger::interval(fold_interval, false),
        handler(move |_ctx| {
            let usage = Arc::clone(&usage);
            async move {
                let report = usage.fold().await?;
                debug!(?report, "Traffic fold finished");
                Ok(())
            }
        }),
    )
    .timeout(short);

    let usage = Arc::clone(&deps.usage);
    let daily_job = JobSpec::new(
        USAGE_DAILY_ROLLUP,
        Trigger::cron(&config.daily_rollup_cron())?,
        handler(move |_ctx| {
            let usage = Arc::clone(&usage);
            async move { usage.daily_rollup().await.map(|_| ()) }
        }),
    )
    .timeout(long);

    let usage = Arc::clone(&deps.usage);
    let monthly_job = JobSpec::new(
        USAGE_MONTHLY_ROLLUP,
        Trigger::cron(&config.monthly_rollup_cron())?,
        handler(move |_ctx| {
            let usage = Arc::clone(&usage);
            async move { usage.monthly_rollup().await.map(|_| ()) }
        }),
    )
    .timeout(long);

    let usage = Arc::clone(&deps.usage);
    let cleanup_job = JobSpec::new(
        USAGE_CLEANUP,
        Trigger::cron(&config.cleanup_cron())?,
        handler(move |_ctx| {
            let usage = Arc::clone(&usage);
            async move { usage.cleanup().await.map(|_| ()) }
        }),
    )
    .timeout(long);

    let reminders = Arc::clone(&deps.reminders);
    let offline_job = JobSpec::new(
        OFFLINE_CHECK,
        Trigger::interval(seconds(config.offline_check_interval_secs), false),
        handler(move |_ctx| {
            let reminders = Arc::clone(&reminders);
            async move { reminders.check_offline().await?.into_result() }
        }),
    )
    .timeout(short);

    let reminders = Arc::clone(&deps.reminders);
    let expiring_job = JobSpec::new(
        EXPIRING_REMINDER,
        Trigger::cron(&config.expiring_reminder_cron)?,
        handler(move |_ctx| {
            let reminders = Arc::clone(&reminders);
            async move { reminders.check_expiring().await?.into_result() }
        }),
    )
    .timeout(long);

    let reminders = Arc::clone(&deps.reminders);
    let digest_job = JobSpec::new(
        DIGEST,
        Trigger::cron(&config.digest_cron)?,
        handler(move |_ctx| {
            let reminders = Arc::clone(&reminders);
            async move { reminders.send_digests().await?.into_result() }
        }),
    )
    .timeout(long);

    Ok(vec![
        payment_job,
        expiry_job,
        fold_job,
        daily_job,
        monthly_job,
        cleanup_job,
        offline_job,
        expiring_job,
        digest_job,
    ])
}

pub fn register_jobs(
    scheduler: &SchedulerManager,
    deps: &JobDependencies,
    config: &SchedulerConfig,
    fold_interval: std::time::Duration,
) -> Result<(), Error> {
    for spec in job_specs(deps, config, fold_interval)? {
        scheduler.register(spec)?;
    }
    Ok(())
}
