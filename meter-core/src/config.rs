use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, ErrorDetails};

pub const REDIS_URL_ENV: &str = "METER_REDIS_URL";
pub const DATABASE_URL_ENV: &str = "METER_DATABASE_URL";

/// Hourly counters are read until the recency boundary (start of the previous
/// business day) passes them. That window spans yesterday and today, which is
/// 49 hours when yesterday had a DST fall-back.
pub const MIN_COUNTER_TTL_HOURS: u64 = 49;
pub const MAX_COUNTER_TTL_HOURS: u64 = 72;
pub const DEFAULT_COUNTER_TTL_HOURS: u64 = 50;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeterConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub online: OnlineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    pub url: Option<SecretString>,
    /// Timeout for a single pipeline round trip
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: Option<SecretString>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Staleness window of SID→ID metadata snapshots
    #[serde(default = "default_metadata_ttl_secs")]
    pub metadata_ttl_secs: u64,
    /// TTL of positive quota entries in the fast store
    #[serde(default = "default_quota_ttl_secs")]
    pub quota_ttl_secs: u64,
    /// TTL of "does not exist / inactive" quota markers
    #[serde(default = "default_quota_null_ttl_secs")]
    pub quota_null_ttl_secs: u64,
    /// TTL of the in-process copy kept in front of the fast store
    #[serde(default = "default_local_ttl_ms")]
    pub local_ttl_ms: u64,
    #[serde(default = "default_local_capacity")]
    pub local_capacity: u64,
    /// Upper bound for a durable-store load on the request path
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// Whether to admit (true) or deny (false) when quota cannot be determined
    #[serde(default)]
    pub fail_open: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: default_metadata_ttl_secs(),
            quota_ttl_secs: default_quota_ttl_secs(),
            quota_null_ttl_secs: default_quota_null_ttl_secs(),
            local_ttl_ms: default_local_ttl_ms(),
            local_capacity: default_local_capacity(),
            load_timeout_ms: default_load_timeout_ms(),
            fail_open: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrafficConfig {
    #[serde(default = "default_counter_ttl_hours")]
    pub counter_ttl_hours: u64,
    #[serde(default = "default_fold_interval_secs")]
    pub fold_interval_secs: u64,
    /// Upper bound for the historical (durable) half of a usage read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            counter_ttl_hours: default_counter_ttl_hours(),
            fold_interval_secs: default_fold_interval_secs(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnlineConfig {
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            stale_threshold_secs: default_stale_threshold_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// IANA name of the business timezone all cron triggers and day boundaries use
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_payment_interval_secs")]
    pub payment_interval_secs: u64,
    /// How long a subscription may stay unpaid before it is cancelled
    #[serde(default = "default_unpaid_grace_secs")]
    pub unpaid_grace_secs: u64,
    #[serde(default = "default_subscription_expiry_interval_secs")]
    pub subscription_expiry_interval_secs: u64,
    #[serde(default = "default_offline_check_interval_secs")]
    pub offline_check_interval_secs: u64,
    #[serde(default = "default_daily_rollup_hour")]
    pub daily_rollup_hour: u32,
    #[serde(default = "default_monthly_rollup_hour")]
    pub monthly_rollup_hour: u32,
    #[serde(default = "default_cleanup_hour")]
    pub cleanup_hour: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_expiring_reminder_cron")]
    pub expiring_reminder_cron: String,
    #[serde(default = "default_digest_cron")]
    pub digest_cron: String,
    /// How far ahead expiry reminders look
    #[serde(default = "default_expiring_window_days")]
    pub expiring_window_days: u32,
    /// Deadline for short jobs (payments, offline checks, fold)
    #[serde(default = "default_short_job_timeout_secs")]
    pub short_job_timeout_secs: u64,
    /// Deadline for long jobs (rollups, cleanup, sweeps, digests)
    #[serde(default = "default_long_job_timeout_secs")]
    pub long_job_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            payment_interval_secs: default_payment_interval_secs(),
            unpaid_grace_secs: default_unpaid_grace_secs(),
            subscription_expiry_interval_secs: default_subscription_expiry_interval_secs(),
            offline_check_interval_secs: default_offline_check_interval_secs(),
            daily_rollup_hour: default_daily_rollup_hour(),
            monthly_rollup_hour: default_monthly_rollup_hour(),
            cleanup_hour: default_cleanup_hour(),
            retention_days: default_retention_days(),
            expiring_reminder_cron: default_expiring_reminder_cron(),
            digest_cron: default_digest_cron(),
            expiring_window_days: default_expiring_window_days(),
            short_job_timeout_secs: default_short_job_timeout_secs(),
            long_job_timeout_secs: default_long_job_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_redis_timeout_ms() -> u64 {
    50
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_metadata_ttl_secs() -> u64 {
    300
}

fn default_quota_ttl_secs() -> u64 {
    300
}

fn default_quota_null_ttl_secs() -> u64 {
    30
}

fn default_local_ttl_ms() -> u64 {
    2000
}

fn default_local_capacity() -> u64 {
    100_000
}

fn default_load_timeout_ms() -> u64 {
    3000
}

fn default_counter_ttl_hours() -> u64 {
    DEFAULT_COUNTER_TTL_HOURS
}

fn default_fold_interval_secs() -> u64 {
    60
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_stale_threshold_secs() -> u64 {
    300
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_payment_interval_secs() -> u64 {
    60
}

fn default_unpaid_grace_secs() -> u64 {
    86_400
}

fn default_subscription_expiry_interval_secs() -> u64 {
    3600
}

fn default_offline_check_interval_secs() -> u64 {
    300
}

fn default_daily_rollup_hour() -> u32 {
    1
}

fn default_monthly_rollup_hour() -> u32 {
    2
}

fn default_cleanup_hour() -> u32 {
    3
}

pub const DEFAULT_RETENTION_DAYS: u32 = 90;

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn default_expiring_reminder_cron() -> String {
    "0 0 9 * * *".to_string()
}

fn default_digest_cron() -> String {
    "0 0 * * * *".to_string()
}

fn default_expiring_window_days() -> u32 {
    3
}

fn default_short_job_timeout_secs() -> u64 {
    50
}

fn default_long_job_timeout_secs() -> u64 {
    1800
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl MeterConfig {
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config: {e}"),
            })
        })
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            if !url.is_empty() {
                self.redis.url = Some(SecretString::from(url));
            }
        }
        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            if !url.is_empty() {
                self.database.url = Some(SecretString::from(url));
            }
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.scheduler.business_timezone()?;
        cron::Schedule::from_str(&self.scheduler.expiring_reminder_cron).map_err(|e| {
            Error::new(ErrorDetails::InvalidCron {
                expression: self.scheduler.expiring_reminder_cron.clone(),
                message: e.to_string(),
            })
        })?;
        cron::Schedule::from_str(&self.scheduler.digest_cron).map_err(|e| {
            Error::new(ErrorDetails::InvalidCron {
                expression: self.scheduler.digest_cron.clone(),
                message: e.to_string(),
            })
        })?;

        if !(MIN_COUNTER_TTL_HOURS..=MAX_COUNTER_TTL_HOURS)
            .contains(&self.traffic.counter_ttl_hours)
        {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "`traffic.counter_ttl_hours` must be between {MIN_COUNTER_TTL_HOURS} and {MAX_COUNTER_TTL_HOURS}"
                ),
            }));
        }
        if self.cache.quota_null_ttl_secs >= self.cache.quota_ttl_secs {
            return Err(Error::new(ErrorDetails::Config {
                message: "`cache.quota_null_ttl_secs` must be shorter than `cache.quota_ttl_secs`"
                    .to_string(),
            }));
        }
        let hours = [
            ("daily_rollup_hour", self.scheduler.daily_rollup_hour),
            ("monthly_rollup_hour", self.scheduler.monthly_rollup_hour),
            ("cleanup_hour", self.scheduler.cleanup_hour),
        ];
        for (name, hour) in hours {
            if hour > 23 {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("`scheduler.{name}` must be an hour between 0 and 23"),
                }));
            }
        }
        // the hour bucket straddling a half-hour midnight closes up to an hour later
        if self.scheduler.daily_rollup_hour == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`scheduler.daily_rollup_hour` must be 1 or later".to_string(),
            }));
        }
        if self.scheduler.cleanup_hour <= self.scheduler.daily_rollup_hour {
            return Err(Error::new(ErrorDetails::Config {
                message: "`scheduler.cleanup_hour` must be later than `scheduler.daily_rollup_hour`"
                    .to_string(),
            }));
        }
        if self.online.stale_threshold_secs == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`online.stale_threshold_secs` must be positive".to_string(),
            }));
        }
        Ok(())
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CacheConfig {
    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn quota_ttl(&self) -> Duration {
        Duration::from_secs(self.quota_ttl_secs)
    }

    pub fn quota_null_ttl(&self) -> Duration {
        Duration::from_secs(self.quota_null_ttl_secs)
    }

    pub fn local_ttl(&self) -> Duration {
        Duration::from_millis(self.local_ttl_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl TrafficConfig {
    pub fn counter_ttl(&self) -> Duration {
        Duration::from_secs(self.counter_ttl_hours * 3600)
    }

    pub fn fold_interval(&self) -> Duration {
        Duration::from_secs(self.fold_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl OnlineConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

impl SchedulerConfig {
    pub fn business_timezone(&self) -> Result<Tz, Error> {
        self.timezone.parse::<Tz>().map_err(|_| {
            Error::new(ErrorDetails::InvalidTimezone {
                name: self.timezone.clone(),
            })
        })
    }

    /// Retention window for raw hourly rows; zero means "not configured".
    pub fn effective_retention_days(&self) -> u32 {
        if self.retention_days == 0 {
            DEFAULT_RETENTION_DAYS
        } else {
            self.retention_days
        }
    }

    pub fn daily_rollup_cron(&self) -> String {
        format!("0 0 {} * * *", self.daily_rollup_hour)
    }

    pub fn monthly_rollup_cron(&self) -> String {
        format!("0 0 {} 1 * *", self.monthly_rollup_hour)
    }

    pub fn cleanup_cron(&self) -> String {
        format!("0 0 {} * * *", self.cleanup_hour)
    }

    pub fn expiring_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.expiring_window_days) * 86_400)
    }

    pub fn short_job_timeout(&self) -> Duration {
        Duration::from_secs(self.short_job_timeout_secs)
    }

    pub fn long_job_timeout(&self) -> Duration {
        Duration::from_secs(self.long_job_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
