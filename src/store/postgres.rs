//! PostgreSQL mirror store
//!
//! Every write is `INSERT .. ON CONFLICT DO UPDATE` or a guarded `UPDATE`,
//! so re-applying an event converges. Stream invariants are enforced in SQL
//! (`GREATEST` for accruals, a closed row is never reopened) and by the
//! `stream_active_xor_paused` check constraint.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::info;

use super::error::StoreError;
use super::models::{
    EscrowRecord, EscrowStatus, JobRecord, JobStatus, ProviderRecord, StreamRecord,
};
use super::{CursorStore, MirrorStore};
use crate::core_types::{Amount, EscrowId, JobId, StreamKey, Version};
use crate::ledger::Address;

const SCHEMA: &str = include_str!("../../migrations/0001_mirror.sql");

pub struct PgMirrorStore {
    pool: PgPool,
}

impl PgMirrorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        info!(max_connections, "PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Create mirror tables if missing
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("Mirror schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn out_of_range(field: &'static str, value: u64) -> StoreError {
    StoreError::OutOfRange { field, value }
}

/// Ledger integers are `u64`; columns are `BIGINT`. Values above `i64::MAX`
/// are rejected rather than wrapped negative.
fn to_db(field: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| out_of_range(field, value))
}

fn from_db(row: &PgRow, table: &'static str, column: &'static str) -> Result<u64, StoreError> {
    let raw: i64 = row.try_get(column)?;
    u64::try_from(raw).map_err(|_| StoreError::CorruptRow {
        table,
        detail: format!("negative {} {}", column, raw),
    })
}

fn parse_address(table: &'static str, raw: &str) -> Result<Address, StoreError> {
    Address::parse(raw).map_err(|e| StoreError::CorruptRow {
        table,
        detail: e.to_string(),
    })
}

fn row_to_provider(row: &PgRow) -> Result<ProviderRecord, StoreError> {
    let address: String = row.try_get("address")?;
    Ok(ProviderRecord {
        address: parse_address("mirror_providers", &address)?,
        name: row.try_get("name")?,
        endpoint: row.try_get("endpoint")?,
        gpu_model: row.try_get("gpu_model")?,
        gpu_count: u32::try_from(row.try_get::<i32, _>("gpu_count")?).map_err(|_| {
            StoreError::CorruptRow {
                table: "mirror_providers",
                detail: "negative gpu_count".to_string(),
            }
        })?,
        price_per_second: from_db(row, "mirror_providers", "price_per_second")?,
        is_active: row.try_get("is_active")?,
        updated_version: from_db(row, "mirror_providers", "updated_version")?,
    })
}

fn row_to_job(row: &PgRow) -> Result<JobRecord, StoreError> {
    let buyer: String = row.try_get("buyer")?;
    let provider: String = row.try_get("provider")?;
    let status_id: i16 = row.try_get("status")?;
    Ok(JobRecord {
        job_id: from_db(row, "mirror_jobs", "job_id")?,
        buyer: parse_address("mirror_jobs", &buyer)?,
        provider: parse_address("mirror_jobs", &provider)?,
        status: JobStatus::from_id(status_id).ok_or_else(|| StoreError::CorruptRow {
            table: "mirror_jobs",
            detail: format!("unknown status {}", status_id),
        })?,
        max_duration_secs: from_db(row, "mirror_jobs", "max_duration_secs")?,
        price_per_second: from_db(row, "mirror_jobs", "price_per_second")?,
        created_at: row.try_get("created_at")?,
        created_version: from_db(row, "mirror_jobs", "created_version")?,
        updated_version: from_db(row, "mirror_jobs", "updated_version")?,
    })
}

fn row_to_escrow(row: &PgRow) -> Result<EscrowRecord, StoreError> {
    let buyer: String = row.try_get("buyer")?;
    let provider: String = row.try_get("provider")?;
    let status_id: i16 = row.try_get("status")?;
    Ok(EscrowRecord {
        escrow_id: from_db(row, "mirror_escrows", "escrow_id")?,
        job_id: from_db(row, "mirror_escrows", "job_id")?,
        buyer: parse_address("mirror_escrows", &buyer)?,
        provider: parse_address("mirror_escrows", &provider)?,
        amount: from_db(row, "mirror_escrows", "amount")?,
        status: EscrowStatus::from_id(status_id).ok_or_else(|| StoreError::CorruptRow {
            table: "mirror_escrows",
            detail: format!("unknown status {}", status_id),
        })?,
        updated_version: from_db(row, "mirror_escrows", "updated_version")?,
    })
}

fn row_to_stream(row: &PgRow) -> Result<StreamRecord, StoreError> {
    let payer: String = row.try_get("payer")?;
    let payee: String = row.try_get("payee")?;
    Ok(StreamRecord {
        payer: parse_address("mirror_streams", &payer)?,
        job_id: from_db(row, "mirror_streams", "job_id")?,
        payee: parse_address("mirror_streams", &payee)?,
        rate_per_second: from_db(row, "mirror_streams", "rate_per_second")?,
        start_time: row.try_get("start_time")?,
        total_accrued: from_db(row, "mirror_streams", "total_accrued")?,
        is_active: row.try_get("is_active")?,
        is_paused: row.try_get("is_paused")?,
        last_processed_at: row.try_get("last_processed_at")?,
        updated_version: from_db(row, "mirror_streams", "updated_version")?,
    })
}

#[async_trait]
impl MirrorStore for PgMirrorStore {
    async fn upsert_provider(&self, p: &ProviderRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO mirror_providers
               (address, name, endpoint, gpu_model, gpu_count, price_per_second, is_active, updated_version)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (address) DO UPDATE
               SET name = EXCLUDED.name,
                   endpoint = EXCLUDED.endpoint,
                   gpu_model = EXCLUDED.gpu_model,
                   gpu_count = EXCLUDED.gpu_count,
                   price_per_second = EXCLUDED.price_per_second,
                   is_active = EXCLUDED.is_active,
                   updated_version = GREATEST(mirror_providers.updated_version, EXCLUDED.updated_version),
                   updated_at = NOW()"#,
        )
        .bind(p.address.as_str())
        .bind(&p.name)
        .bind(&p.endpoint)
        .bind(&p.gpu_model)
        .bind(i32::try_from(p.gpu_count).map_err(|_| out_of_range("gpu_count", u64::from(p.gpu_count)))?)
        .bind(to_db("price_per_second", p.price_per_second)?)
        .bind(p.is_active)
        .bind(to_db("updated_version", p.updated_version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_provider_active(
        &self,
        address: &Address,
        is_active: bool,
        version: Version,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE mirror_providers
               SET is_active = $2,
                   updated_version = GREATEST(updated_version, $3),
                   updated_at = NOW()
               WHERE address = $1"#,
        )
        .bind(address.as_str())
        .bind(is_active)
        .bind(to_db("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_provider(&self, address: &Address) -> Result<Option<ProviderRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM mirror_providers WHERE address = $1")
            .bind(address.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_provider).transpose()
    }

    async fn upsert_job(&self, j: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO mirror_jobs
               (job_id, buyer, provider, status, max_duration_secs, price_per_second,
                created_at, created_version, updated_version)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (job_id) DO UPDATE
               SET buyer = EXCLUDED.buyer,
                   provider = EXCLUDED.provider,
                   status = EXCLUDED.status,
                   max_duration_secs = EXCLUDED.max_duration_secs,
                   price_per_second = EXCLUDED.price_per_second,
                   created_at = EXCLUDED.created_at,
                   created_version = CASE WHEN mirror_jobs.created_version = 0
                                          THEN EXCLUDED.created_version
                                          ELSE mirror_jobs.created_version END,
                   updated_version = GREATEST(mirror_jobs.updated_version, EXCLUDED.updated_version),
                   updated_at = NOW()"#,
        )
        .bind(to_db("job_id", j.job_id)?)
        .bind(j.buyer.as_str())
        .bind(j.provider.as_str())
        .bind(j.status.id())
        .bind(to_db("max_duration_secs", j.max_duration_secs)?)
        .bind(to_db("price_per_second", j.price_per_second)?)
        .bind(j.created_at)
        .bind(to_db("created_version", j.created_version)?)
        .bind(to_db("updated_version", j.updated_version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        version: Version,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE mirror_jobs
               SET status = $2,
                   updated_version = GREATEST(updated_version, $3),
                   updated_at = NOW()
               WHERE job_id = $1"#,
        )
        .bind(to_db("job_id", job_id)?)
        .bind(status.id())
        .bind(to_db("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM mirror_jobs WHERE job_id = $1")
            .bind(to_db("job_id", job_id)?)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_jobs_by_parties(
        &self,
        buyer: &Address,
        provider: &Address,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM mirror_jobs WHERE buyer = $1 AND provider = $2 ORDER BY job_id",
        )
        .bind(buyer.as_str())
        .bind(provider.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn upsert_escrow(&self, e: &EscrowRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO mirror_escrows
               (escrow_id, job_id, buyer, provider, amount, status, updated_version)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (escrow_id) DO UPDATE
               SET job_id = EXCLUDED.job_id,
                   buyer = EXCLUDED.buyer,
                   provider = EXCLUDED.provider,
                   amount = EXCLUDED.amount,
                   status = EXCLUDED.status,
                   updated_version = GREATEST(mirror_escrows.updated_version, EXCLUDED.updated_version),
                   updated_at = NOW()"#,
        )
        .bind(to_db("escrow_id", e.escrow_id)?)
        .bind(to_db("job_id", e.job_id)?)
        .bind(e.buyer.as_str())
        .bind(e.provider.as_str())
        .bind(to_db("amount", e.amount)?)
        .bind(e.status.id())
        .bind(to_db("updated_version", e.updated_version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_escrow_status(
        &self,
        escrow_id: EscrowId,
        status: EscrowStatus,
        version: Version,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE mirror_escrows
               SET status = $2,
                   updated_version = GREATEST(updated_version, $3),
                   updated_at = NOW()
               WHERE escrow_id = $1"#,
        )
        .bind(to_db("escrow_id", escrow_id)?)
        .bind(status.id())
        .bind(to_db("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_escrow(&self, escrow_id: EscrowId) -> Result<Option<EscrowRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM mirror_escrows WHERE escrow_id = $1")
            .bind(to_db("escrow_id", escrow_id)?)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_escrow).transpose()
    }

    async fn upsert_stream(&self, s: &StreamRecord) -> Result<(), StoreError> {
        let (is_active, is_paused) = StreamRecord::normalize_flags(s.is_active, s.is_paused);
        sqlx::query(
            r#"INSERT INTO mirror_streams
               (payer, job_id, payee, rate_per_second, start_time, total_accrued,
                is_active, is_paused, last_processed_at, updated_version)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               ON CONFLICT (payer, job_id) DO UPDATE
               SET payee = EXCLUDED.payee,
                   rate_per_second = EXCLUDED.rate_per_second,
                   start_time = EXCLUDED.start_time,
                   total_accrued = GREATEST(mirror_streams.total_accrued, EXCLUDED.total_accrued),
                   last_processed_at = GREATEST(mirror_streams.last_processed_at, EXCLUDED.last_processed_at),
                   is_active = (mirror_streams.is_active OR mirror_streams.is_paused)
                               AND EXCLUDED.is_active,
                   is_paused = (mirror_streams.is_active OR mirror_streams.is_paused)
                               AND EXCLUDED.is_paused,
                   updated_version = GREATEST(mirror_streams.updated_version, EXCLUDED.updated_version),
                   updated_at = NOW()"#,
        )
        .bind(s.payer.as_str())
        .bind(to_db("job_id", s.job_id)?)
        .bind(s.payee.as_str())
        .bind(to_db("rate_per_second", s.rate_per_second)?)
        .bind(s.start_time)
        .bind(to_db("total_accrued", s.total_accrued)?)
        .bind(is_active)
        .bind(is_paused)
        .bind(s.last_processed_at)
        .bind(to_db("updated_version", s.updated_version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_accrual(
        &self,
        key: &StreamKey,
        total_accrued: Amount,
        processed_at: Option<i64>,
        version: Version,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE mirror_streams
               SET total_accrued = GREATEST(total_accrued, $3),
                   last_processed_at = GREATEST(last_processed_at, $4),
                   updated_version = GREATEST(updated_version, $5),
                   updated_at = NOW()
               WHERE payer = $1 AND job_id = $2"#,
        )
        .bind(key.payer.as_str())
        .bind(to_db("job_id", key.job_id)?)
        .bind(to_db("total_accrued", total_accrued)?)
        .bind(processed_at)
        .bind(to_db("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn pause_stream(&self, key: &StreamKey, version: Version) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE mirror_streams
               SET is_active = FALSE,
                   is_paused = TRUE,
                   updated_version = GREATEST(updated_version, $3),
                   updated_at = NOW()
               WHERE payer = $1 AND job_id = $2 AND (is_active OR is_paused)"#,
        )
        .bind(key.payer.as_str())
        .bind(to_db("job_id", key.job_id)?)
        .bind(to_db("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resume_stream(&self, key: &StreamKey, version: Version) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE mirror_streams
               SET is_active = TRUE,
                   is_paused = FALSE,
                   updated_version = GREATEST(updated_version, $3),
                   updated_at = NOW()
               WHERE payer = $1 AND job_id = $2 AND (is_active OR is_paused)"#,
        )
        .bind(key.payer.as_str())
        .bind(to_db("job_id", key.job_id)?)
        .bind(to_db("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn close_stream(
        &self,
        key: &StreamKey,
        final_accrued: Option<Amount>,
        version: Version,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"UPDATE mirror_streams
               SET is_active = FALSE,
                   is_paused = FALSE,
                   total_accrued = GREATEST(total_accrued, COALESCE($3, total_accrued)),
                   updated_version = GREATEST(updated_version, $4),
                   updated_at = NOW()
               WHERE payer = $1 AND job_id = $2"#,
        )
        .bind(key.payer.as_str())
        .bind(to_db("job_id", key.job_id)?)
        .bind(final_accrued.map(|v| to_db("final_accrued", v)).transpose()?)
        .bind(to_db("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_stream(&self, key: &StreamKey) -> Result<Option<StreamRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM mirror_streams WHERE payer = $1 AND job_id = $2")
            .bind(key.payer.as_str())
            .bind(to_db("job_id", key.job_id)?)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_stream).transpose()
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for PgMirrorStore {
    async fn get(&self) -> Result<Option<Version>, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT last_processed_version FROM sync_cursor WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        version
            .map(|v| {
                Version::try_from(v).map_err(|_| StoreError::CorruptRow {
                    table: "sync_cursor",
                    detail: format!("negative version {}", v),
                })
            })
            .transpose()
    }

    async fn set(&self, version: Version) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO sync_cursor (id, last_processed_version)
               VALUES (1, $1)
               ON CONFLICT (id) DO UPDATE
               SET last_processed_version = GREATEST(sync_cursor.last_processed_version, EXCLUDED.last_processed_version),
                   updated_at = NOW()"#,
        )
        .bind(to_db("version", version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
