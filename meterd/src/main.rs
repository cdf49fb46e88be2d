use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;

use meter_core::aggregator::RepositoryAggregator;
use meter_core::clock::{Clock, SystemClock};
use meter_core::config::MeterConfig;
use meter_core::durable::postgres::{connect_pool, ensure_schema};
use meter_core::durable::{
    MemorySubscriptionRepository, MemoryUsageRepository, PgSubscriptionRepository,
    PgUsageRepository, SubscriptionRepository, UsageRepository,
};
use meter_core::error;
use meter_core::fast_store::{FastStore, MemoryFastStore, RedisFastStore};
use meter_core::jobs::{
    register_jobs, JobDependencies, PaymentMaintenance, ReminderJobs, ReminderSource, UsageJobs,
};
use meter_core::metadata_cache::CachedDirectory;
use meter_core::observability::{self, LogFormat};
use meter_core::online::StatusRegistry;
use meter_core::scheduler::{SchedulerManager, ShutdownOutcome};
use meter_core::traffic::TrafficBuffer;

mod maintenance;

use maintenance::{
    Inert, LogNotifier, NodeRecord, PgNodeSource, PgPaymentMaintenance, PgReminderSource,
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the metering config file at the specified path. Built-in defaults apply when omitted
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Sets the log format used for all logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,

    /// Run every job against in-memory stores instead of Redis and Postgres
    #[arg(long)]
    dry_run: bool,
}

struct Backends {
    store: Arc<dyn FastStore>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    usage: Arc<dyn UsageRepository>,
    payments: Arc<dyn PaymentMaintenance>,
    reminder_source: Arc<dyn ReminderSource>,
}

impl Backends {
    fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(MemoryFastStore::new(clock)),
            subscriptions: Arc::new(MemorySubscriptionRepository::new()),
            usage: Arc::new(MemoryUsageRepository::new()),
            payments: Arc::new(Inert),
            reminder_source: Arc::new(Inert),
        }
    }

    async fn connect(config: &MeterConfig, clock: Arc<dyn Clock>) -> Self {
        let redis_url = config
            .redis
            .url
            .as_ref()
            .expect_pretty("`redis.url` (or METER_REDIS_URL) must be set unless running with `--dry-run`");
        let store = RedisFastStore::connect(redis_url, config.redis.timeout())
            .await
            .expect_pretty("Failed to connect to Redis");

        let database_url = config
            .database
            .url
            .as_ref()
            .expect_pretty("`database.url` (or METER_DATABASE_URL) must be set unless running with `--dry-run`");
        let pool = connect_pool(
            database_url,
            config.database.max_connections,
            Duration::from_millis(config.database.connect_timeout_ms),
        )
        .await
        .expect_pretty("Failed to connect to Postgres");
        ensure_schema(&pool)
            .await
            .expect_pretty("Failed to create usage tables");

        let subscriptions: Arc<dyn SubscriptionRepository> =
            Arc::new(PgSubscriptionRepository::new(pool.clone()));
        let nodes: Arc<CachedDirectory<NodeRecord>> = Arc::new(CachedDirectory::new(
            "nodes",
            Arc::new(PgNodeSource::new(pool.clone())),
            config.cache.metadata_ttl(),
            clock,
        ));
        Self {
            store: Arc::new(store),
            usage: Arc::new(PgUsageRepository::new(pool.clone())),
            payments: Arc::new(PgPaymentMaintenance::new(
                pool.clone(),
                Duration::from_secs(config.scheduler.unpaid_grace_secs),
            )),
            reminder_source: Arc::new(PgReminderSource::new(
                pool,
                nodes,
                Arc::clone(&subscriptions),
            )),
            subscriptions,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    tracing::info!("Starting meterd {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config_file {
        Some(path) => MeterConfig::load_from_path(path)
            .ok() // Already logged when constructed
            .expect_pretty("Failed to load config"),
        None => {
            tracing::warn!("No config file provided, using defaults. Use `--config-file path/to/meter.toml` to specify one.");
            let mut config = MeterConfig::default();
            config.apply_env_overrides();
            config
                .validate()
                .ok()
                .expect_pretty("Invalid default config");
            config
        }
    };
    error::set_debug(config.debug).expect_pretty("Failed to set debug mode");

    let timezone = config
        .scheduler
        .business_timezone()
        .expect_pretty("Failed to resolve business timezone");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let backends = if args.dry_run {
        tracing::warn!("Dry run: using in-memory stores, nothing is persisted");
        Backends::in_memory(Arc::clone(&clock))
    } else {
        Backends::connect(&config, Arc::clone(&clock)).await
    };

    let buffer = Arc::new(TrafficBuffer::new(
        Arc::clone(&backends.store),
        Arc::clone(&backends.usage),
        Arc::clone(&clock),
        config.traffic.counter_ttl(),
    ));
    let aggregator = Arc::new(RepositoryAggregator::new(
        Arc::clone(&backends.usage),
        Arc::clone(&clock),
        timezone,
    ));
    let usage_jobs = Arc::new(UsageJobs::new(
        buffer,
        aggregator,
        Arc::clone(&clock),
        timezone,
        config.scheduler.effective_retention_days(),
    ));
    let reminders = Arc::new(ReminderJobs::new(
        backends.reminder_source,
        Arc::new(StatusRegistry::new(
            Arc::clone(&backends.store),
            Arc::clone(&clock),
        )),
        Arc::new(LogNotifier),
        Arc::clone(&clock),
        timezone,
        config.scheduler.expiring_window(),
    ));
    let deps = JobDependencies {
        payments: backends.payments,
        subscriptions: backends.subscriptions,
        usage: usage_jobs,
        reminders,
        clock: Arc::clone(&clock),
    };

    let scheduler = SchedulerManager::new(timezone, clock);
    register_jobs(
        &scheduler,
        &deps,
        &config.scheduler,
        config.traffic.fold_interval(),
    )
    .expect_pretty("Failed to register jobs");
    scheduler.start().expect_pretty("Failed to start scheduler");

    shutdown_signal().await;

    let grace = config.scheduler.shutdown_grace();
    tracing::info!(
        grace_secs = grace.as_secs(),
        "Stopping scheduler, waiting for running jobs"
    );
    match scheduler.stop(grace).await {
        ShutdownOutcome::Clean => tracing::info!("meterd stopped cleanly"),
        ShutdownOutcome::Forced { cancelled } => {
            tracing::warn!(?cancelled, "meterd stopped after cancelling running jobs");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// Startup-only escape hatch: logs `msg` with the error and exits with status 1.
///
/// Everything past initialization propagates errors instead.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
