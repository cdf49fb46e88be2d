use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{
    merge_records, Plan, PlanType, ResourceType, Subscription, SubscriptionRef,
    SubscriptionRepository, SubscriptionStatus, UsageRecord, UsageRepository, UsageTotals,
};
use crate::error::{Error, ErrorDetails};
use crate::metadata_cache::MetadataSource;

/// Tables owned by the accounting core. `subscriptions` and `plans` belong to
/// the subscription service and are only read (and expired) from here.
pub const USAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_hourly (
    resource_type TEXT NOT NULL,
    resource_id BIGINT NOT NULL,
    subscription_id BIGINT,
    period_start TIMESTAMPTZ NOT NULL,
    upload_bytes BIGINT NOT NULL DEFAULT 0,
    download_bytes BIGINT NOT NULL DEFAULT 0,
    UNIQUE NULLS NOT DISTINCT (resource_type, resource_id, subscription_id, period_start)
);
CREATE TABLE IF NOT EXISTS usage_daily (
    resource_type TEXT NOT NULL,
    resource_id BIGINT NOT NULL,
    subscription_id BIGINT,
    day DATE NOT NULL,
    upload_bytes BIGINT NOT NULL DEFAULT 0,
    download_bytes BIGINT NOT NULL DEFAULT 0,
    UNIQUE NULLS NOT DISTINCT (resource_type, resource_id, subscription_id, day)
);
CREATE TABLE IF NOT EXISTS usage_monthly (
    resource_type TEXT NOT NULL,
    resource_id BIGINT NOT NULL,
    subscription_id BIGINT,
    month DATE NOT NULL,
    upload_bytes BIGINT NOT NULL DEFAULT 0,
    download_bytes BIGINT NOT NULL DEFAULT 0,
    UNIQUE NULLS NOT DISTINCT (resource_type, resource_id, subscription_id, month)
);
CREATE TABLE IF NOT EXISTS usage_rollups (
    day DATE PRIMARY KEY,
    range_start TIMESTAMPTZ NOT NULL,
    range_end TIMESTAMPTZ NOT NULL,
    rolled_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS usage_daily_subscription_day ON usage_daily (subscription_id, day);
CREATE INDEX IF NOT EXISTS usage_hourly_period_start ON usage_hourly (period_start);
"#;

pub async fn connect_pool(
    url: &SecretString,
    max_connections: u32,
    connect_timeout: Duration,
) -> Result<PgPool, Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(connect_timeout)
        .connect(url.expose_secret())
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to connect to Postgres: {e}"),
            })
        })
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), Error> {
    sqlx::raw_sql(USAGE_SCHEMA).execute(pool).await?;
    Ok(())
}

fn to_db(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn from_db(bytes: i64) -> u64 {
    u64::try_from(bytes).unwrap_or(0)
}

fn type_names(resource_types: &[ResourceType]) -> Vec<String> {
    resource_types.iter().map(|t| t.as_ref().to_string()).collect()
}

fn parse_column<T: FromStr>(column: &str, value: &str) -> Result<T, Error> {
    value.parse::<T>().map_err(|_| {
        Error::new(ErrorDetails::Database {
            message: format!("Unexpected value `{value}` in column `{column}`"),
        })
    })
}

#[derive(Clone)]
pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionPlanRow {
    id: i64,
    sid: String,
    user_id: i64,
    plan_id: i64,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    end_at: Option<DateTime<Utc>>,
    plan_type: String,
    traffic_limit: i64,
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    sid: String,
    user_id: i64,
    plan_id: i64,
    status: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    end_at: Option<DateTime<Utc>>,
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn find_with_plan(&self, subscription_id: i64) -> Result<Option<(Subscription, Plan)>, Error> {
        let row = sqlx::query_as::<_, SubscriptionPlanRow>(
            "SELECT s.id, s.sid, s.user_id, s.plan_id, s.status, s.current_period_start, \
                    s.current_period_end, s.end_at, p.plan_type, p.traffic_limit \
             FROM subscriptions s JOIN plans p ON p.id = s.plan_id \
             WHERE s.id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let subscription = Subscription {
            id: row.id,
            sid: row.sid,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: parse_column::<SubscriptionStatus>("subscriptions.status", &row.status)?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            end_at: row.end_at,
        };
        let plan = Plan {
            id: row.plan_id,
            plan_type: parse_column::<PlanType>("plans.plan_type", &row.plan_type)?,
            traffic_limit: from_db(row.traffic_limit),
        };
        Ok(Some((subscription, plan)))
    }

    async fn mark_expired(&self, now: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'expired' \
             WHERE status = 'active' AND end_at IS NOT NULL AND end_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_ending_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, Error> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT id, sid, user_id, plan_id, status, current_period_start, current_period_end, end_at \
             FROM subscriptions \
             WHERE status = 'active' AND end_at >= $1 AND end_at < $2 \
             ORDER BY end_at, id",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(Subscription {
                    id: row.id,
                    sid: row.sid,
                    user_id: row.user_id,
                    plan_id: row.plan_id,
                    status: parse_column::<SubscriptionStatus>("subscriptions.status", &row.status)?,
                    current_period_start: row.current_period_start,
                    current_period_end: row.current_period_end,
                    end_at: row.end_at,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MetadataSource<SubscriptionRef> for PgSubscriptionRepository {
    async fn load_all(&self) -> Result<Vec<SubscriptionRef>, Error> {
        let rows = sqlx::query_as::<_, (i64, String)>("SELECT id, sid FROM subscriptions")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, sid)| SubscriptionRef { id, sid })
            .collect())
    }
}

#[derive(Clone)]
pub struct PgUsageRepository {
    pool: PgPool,
}

impl PgUsageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageRepository for PgUsageRepository {
    async fn upsert_hourly(&self, records: &[UsageRecord]) -> Result<(), Error> {
        if records.is_empty() {
            return Ok(());
        }
        let records = merge_records(records);
        let mut resource_types = Vec::with_capacity(records.len());
        let mut resource_ids = Vec::with_capacity(records.len());
        let mut subscription_ids: Vec<Option<i64>> = Vec::with_capacity(records.len());
        let mut period_starts = Vec::with_capacity(records.len());
        let mut uploads = Vec::with_capacity(records.len());
        let mut downloads = Vec::with_capacity(records.len());
        for record in &records {
            resource_types.push(record.resource_type.as_ref().to_string());
            resource_ids.push(record.resource_id);
            subscription_ids.push(record.subscription_id);
            period_starts.push(record.period_start);
            uploads.push(to_db(record.upload));
            downloads.push(to_db(record.download));
        }

        sqlx::query(
            "INSERT INTO usage_hourly \
                (resource_type, resource_id, subscription_id, period_start, upload_bytes, download_bytes) \
             SELECT * FROM UNNEST($1::text[], $2::bigint[], $3::bigint[], $4::timestamptz[], $5::bigint[], $6::bigint[]) \
             ON CONFLICT (resource_type, resource_id, subscription_id, period_start) DO UPDATE SET \
                upload_bytes = usage_hourly.upload_bytes + EXCLUDED.upload_bytes, \
                download_bytes = usage_hourly.download_bytes + EXCLUDED.download_bytes",
        )
        .bind(resource_types)
        .bind(resource_ids)
        .bind(subscription_ids)
        .bind(period_starts)
        .bind(uploads)
        .bind(downloads)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sum_daily(
        &self,
        subscription_ids: &[i64],
        resource_types: &[ResourceType],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<UsageTotals, Error> {
        if subscription_ids.is_empty() || resource_types.is_empty() || from >= to {
            return Ok(UsageTotals::default());
        }
        let (upload, download) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(SUM(upload_bytes), 0)::BIGINT, COALESCE(SUM(download_bytes), 0)::BIGINT \
             FROM usage_daily \
             WHERE subscription_id = ANY($1) AND resource_type = ANY($2) AND day >= $3 AND day < $4",
        )
        .bind(subscription_ids)
        .bind(type_names(resource_types))
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(UsageTotals::new(from_db(upload), from_db(download)))
    }

    async fn sum_hourly(
        &self,
        subscription_ids: &[i64],
        resource_types: &[ResourceType],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<UsageTotals, Error> {
        if subscription_ids.is_empty() || resource_types.is_empty() || from >= to {
            return Ok(UsageTotals::default());
        }
        let (upload, download) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COALESCE(SUM(upload_bytes), 0)::BIGINT, COALESCE(SUM(download_bytes), 0)::BIGINT \
             FROM usage_hourly \
             WHERE subscription_id = ANY($1) AND resource_type = ANY($2) \
               AND period_start >= $3 AND period_start < $4",
        )
        .bind(subscription_ids)
        .bind(type_names(resource_types))
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(UsageTotals::new(from_db(upload), from_db(download)))
    }

    async fn rollup_daily(&self, day: NaiveDate, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<u64, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM usage_daily WHERE day = $1")
            .bind(day)
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(
            "INSERT INTO usage_daily \
                (resource_type, resource_id, subscription_id, day, upload_bytes, download_bytes) \
             SELECT resource_type, resource_id, subscription_id, $1, \
                    SUM(upload_bytes)::BIGINT, SUM(download_bytes)::BIGINT \
             FROM usage_hourly \
             WHERE period_start >= $2 AND period_start < $3 \
             GROUP BY resource_type, resource_id, subscription_id",
        )
        .bind(day)
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO usage_rollups (day, range_start, range_end) VALUES ($1, $2, $3) \
             ON CONFLICT (day) DO UPDATE SET \
                range_start = EXCLUDED.range_start, range_end = EXCLUDED.range_end, rolled_at = now()",
        )
        .bind(day)
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(inserted.rows_affected())
    }

    async fn rollup_monthly(&self, month: NaiveDate, from: NaiveDate, to: NaiveDate) -> Result<u64, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM usage_monthly WHERE month = $1")
            .bind(month)
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(
            "INSERT INTO usage_monthly \
                (resource_type, resource_id, subscription_id, month, upload_bytes, download_bytes) \
             SELECT resource_type, resource_id, subscription_id, $1, \
                    SUM(upload_bytes)::BIGINT, SUM(download_bytes)::BIGINT \
             FROM usage_daily \
             WHERE day >= $2 AND day < $3 \
             GROUP BY resource_type, resource_id, subscription_id",
        )
        .bind(month)
        .bind(from)
        .bind(to)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(inserted.rows_affected())
    }

    async fn delete_hourly_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM usage_hourly h USING usage_rollups r \
             WHERE h.period_start < $1 \
               AND h.period_start >= r.range_start AND h.period_start < r.range_end",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
