//! Mirror Store
//!
//! Durable off-ledger copy of ledger-derived domain state plus the indexer's
//! sync cursor. Written only by the indexer; read by the query layer.
//!
//! Every write is an upsert or an idempotent state transition keyed by the
//! entity's natural id, so replaying an event converges to the same state.
//! A missing row means "not yet synchronized", never "absent on the ledger".

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;

use crate::core_types::{Amount, EscrowId, JobId, StreamKey, Version};
use crate::ledger::Address;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::{EscrowRecord, EscrowStatus, JobRecord, JobStatus, ProviderRecord, StreamRecord};
pub use postgres::PgMirrorStore;

/// Keyed storage for mirrored entities.
///
/// Transition methods return `Ok(false)` when the target row is not
/// mirrored yet (or the transition does not apply), `Ok(true)` otherwise.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    // === Providers ===
    async fn upsert_provider(&self, provider: &ProviderRecord) -> Result<(), StoreError>;

    async fn set_provider_active(
        &self,
        address: &Address,
        is_active: bool,
        version: Version,
    ) -> Result<bool, StoreError>;

    async fn get_provider(&self, address: &Address) -> Result<Option<ProviderRecord>, StoreError>;

    // === Jobs ===
    async fn upsert_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    async fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        version: Version,
    ) -> Result<bool, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Jobs between `buyer` and `provider`, ascending by id
    async fn find_jobs_by_parties(
        &self,
        buyer: &Address,
        provider: &Address,
    ) -> Result<Vec<JobRecord>, StoreError>;

    // === Escrows ===
    async fn upsert_escrow(&self, escrow: &EscrowRecord) -> Result<(), StoreError>;

    async fn update_escrow_status(
        &self,
        escrow_id: EscrowId,
        status: EscrowStatus,
        version: Version,
    ) -> Result<bool, StoreError>;

    async fn get_escrow(&self, escrow_id: EscrowId) -> Result<Option<EscrowRecord>, StoreError>;

    // === Streams ===

    /// Insert or merge via [`StreamRecord::merge`] semantics
    async fn upsert_stream(&self, stream: &StreamRecord) -> Result<(), StoreError>;

    /// Raise `total_accrued` to at least `total_accrued`
    async fn record_accrual(
        &self,
        key: &StreamKey,
        total_accrued: Amount,
        processed_at: Option<i64>,
        version: Version,
    ) -> Result<bool, StoreError>;

    /// Active -> paused. No-op on closed streams.
    async fn pause_stream(&self, key: &StreamKey, version: Version) -> Result<bool, StoreError>;

    /// Paused -> active. No-op on closed streams.
    async fn resume_stream(&self, key: &StreamKey, version: Version) -> Result<bool, StoreError>;

    /// Terminal close, optionally raising the final accrual
    async fn close_stream(
        &self,
        key: &StreamKey,
        final_accrued: Option<Amount>,
        version: Version,
    ) -> Result<bool, StoreError>;

    async fn get_stream(&self, key: &StreamKey) -> Result<Option<StreamRecord>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Durable singleton bookmark into the ledger's version sequence
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self) -> Result<Option<Version>, StoreError>;

    /// Persist `version`. Never lowers an already persisted value.
    async fn set(&self, version: Version) -> Result<(), StoreError>;
}
