//! In-process mirror store.
//!
//! Backs tests and `--memory-store` dry runs. Stream state follows the same
//! rules as the PostgreSQL store: [`StreamRecord::merge`] for upserts and
//! [`StreamRecord::normalize_flags`] for incoming flags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::error::StoreError;
use super::models::{
    EscrowRecord, EscrowStatus, JobRecord, JobStatus, ProviderRecord, StreamRecord,
};
use super::{CursorStore, MirrorStore};
use crate::core_types::{Amount, EscrowId, JobId, StreamKey, Version};
use crate::ledger::Address;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemorySnapshot {
    pub providers: HashMap<Address, ProviderRecord>,
    pub jobs: HashMap<JobId, JobRecord>,
    pub escrows: HashMap<EscrowId, EscrowRecord>,
    pub streams: HashMap<StreamKey, StreamRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemorySnapshot>,
    cursor: RwLock<Option<Version>>,
    /// Simulates a crash between applying a page and persisting the cursor
    fail_cursor_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every mirrored entity, for assertions
    pub async fn snapshot(&self) -> MemorySnapshot {
        self.state.read().await.clone()
    }

    pub fn set_fail_cursor_writes(&self, fail: bool) {
        self.fail_cursor_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of entity write calls received (cursor writes excluded)
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MirrorStore for MemoryStore {
    async fn upsert_provider(&self, provider: &ProviderRecord) -> Result<(), StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        let version = state
            .providers
            .get(&provider.address)
            .map(|p| p.updated_version.max(provider.updated_version))
            .unwrap_or(provider.updated_version);
        let mut record = provider.clone();
        record.updated_version = version;
        state.providers.insert(provider.address.clone(), record);
        Ok(())
    }

    async fn set_provider_active(
        &self,
        address: &Address,
        is_active: bool,
        version: Version,
    ) -> Result<bool, StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        let Some(provider) = state.providers.get_mut(address) else {
            return Ok(false);
        };
        provider.is_active = is_active;
        provider.updated_version = provider.updated_version.max(version);
        Ok(true)
    }

    async fn get_provider(&self, address: &Address) -> Result<Option<ProviderRecord>, StoreError> {
        Ok(self.state.read().await.providers.get(address).cloned())
    }

    async fn upsert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&job.job_id) {
            Some(existing) => {
                let created_version = match existing.created_version {
                    0 => job.created_version,
                    v => v,
                };
                let updated_version = existing.updated_version.max(job.updated_version);
                *existing = job.clone();
                existing.created_version = created_version;
                existing.updated_version = updated_version;
            }
            None => {
                state.jobs.insert(job.job_id, job.clone());
            }
        }
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        version: Version,
    ) -> Result<bool, StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        job.status = status;
        job.updated_version = job.updated_version.max(version);
        Ok(true)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.state.read().await.jobs.get(&job_id).cloned())
    }

    async fn find_jobs_by_parties(
        &self,
        buyer: &Address,
        provider: &Address,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.read().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|j| &j.buyer == buyer && &j.provider == provider)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.job_id);
        Ok(jobs)
    }

    async fn upsert_escrow(&self, escrow: &EscrowRecord) -> Result<(), StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        let version = state
            .escrows
            .get(&escrow.escrow_id)
            .map(|e| e.updated_version.max(escrow.updated_version))
            .unwrap_or(escrow.updated_version);
        let mut record = escrow.clone();
        record.updated_version = version;
        state.escrows.insert(escrow.escrow_id, record);
        Ok(())
    }

    async fn update_escrow_status(
        &self,
        escrow_id: EscrowId,
        status: EscrowStatus,
        version: Version,
    ) -> Result<bool, StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        let Some(escrow) = state.escrows.get_mut(&escrow_id) else {
            return Ok(false);
        };
        escrow.status = status;
        escrow.updated_version = escrow.updated_version.max(version);
        Ok(true)
    }

    async fn get_escrow(&self, escrow_id: EscrowId) -> Result<Option<EscrowRecord>, StoreError> {
        Ok(self.state.read().await.escrows.get(&escrow_id).cloned())
    }

    async fn upsert_stream(&self, stream: &StreamRecord) -> Result<(), StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        match state.streams.get_mut(&stream.key()) {
            Some(existing) => existing.merge(stream),
            None => {
                let mut record = stream.clone();
                (record.is_active, record.is_paused) =
                    StreamRecord::normalize_flags(stream.is_active, stream.is_paused);
                state.streams.insert(stream.key(), record);
            }
        }
        Ok(())
    }

    async fn record_accrual(
        &self,
        key: &StreamKey,
        total_accrued: Amount,
        processed_at: Option<i64>,
        version: Version,
    ) -> Result<bool, StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        let Some(stream) = state.streams.get_mut(key) else {
            return Ok(false);
        };
        stream.total_accrued = stream.total_accrued.max(total_accrued);
        if let Some(at) = processed_at {
            stream.last_processed_at = Some(stream.last_processed_at.map_or(at, |p| p.max(at)));
        }
        stream.updated_version = stream.updated_version.max(version);
        Ok(true)
    }

    async fn pause_stream(&self, key: &StreamKey, version: Version) -> Result<bool, StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        match state.streams.get_mut(key) {
            Some(stream) if !stream.is_closed() => {
                stream.is_active = false;
                stream.is_paused = true;
                stream.updated_version = stream.updated_version.max(version);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resume_stream(&self, key: &StreamKey, version: Version) -> Result<bool, StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        match state.streams.get_mut(key) {
            Some(stream) if !stream.is_closed() => {
                stream.is_active = true;
                stream.is_paused = false;
                stream.updated_version = stream.updated_version.max(version);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close_stream(
        &self,
        key: &StreamKey,
        final_accrued: Option<Amount>,
        version: Version,
    ) -> Result<bool, StoreError> {
        self.count_write();
        let mut state = self.state.write().await;
        let Some(stream) = state.streams.get_mut(key) else {
            return Ok(false);
        };
        stream.is_active = false;
        stream.is_paused = false;
        if let Some(total) = final_accrued {
            stream.total_accrued = stream.total_accrued.max(total);
        }
        stream.updated_version = stream.updated_version.max(version);
        Ok(true)
    }

    async fn get_stream(&self, key: &StreamKey) -> Result<Option<StreamRecord>, StoreError> {
        Ok(self.state.read().await.streams.get(key).cloned())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get(&self) -> Result<Option<Version>, StoreError> {
        Ok(*self.cursor.read().await)
    }

    async fn set(&self, version: Version) -> Result<(), StoreError> {
        if self.fail_cursor_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("cursor write failed".to_string()));
        }
        let mut cursor = self.cursor.write().await;
        *cursor = Some(cursor.map_or(version, |c| c.max(version)));
        Ok(())
    }
}
