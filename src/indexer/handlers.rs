//! Event handlers
//!
//! Turns one ledger event into one mirror write. Every write is an upsert or
//! an idempotent transition keyed by the entity's natural id.
//!
//! Record-carrying events are refreshed from the ledger's view functions
//! first: the current canonical record is overlaid on the event payload, so
//! the mirror converges on ledger state even when a payload is partial. If
//! the view call fails the payload is used unchanged.

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::error::IndexerError;
use super::events::{DomainEvent, EventKind};
use crate::core_types::{StreamKey, Version};
use crate::ledger::types::{first_return, value_as_u64};
use crate::ledger::{Address, LedgerClient, LedgerEvent, LedgerModules, functions};
use crate::store::{
    EscrowRecord, EscrowStatus, JobRecord, JobStatus, MirrorStore, ProviderRecord, StreamRecord,
};

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A mirror row was written
    Applied,
    /// Transition for a row the mirror does not hold yet
    NotMirrored,
    /// Event type the mirror does not track
    Ignored,
}

pub struct EventApplier {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn MirrorStore>,
    modules: LedgerModules,
    refresh_from_views: bool,
}

impl EventApplier {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn MirrorStore>,
        modules: LedgerModules,
        refresh_from_views: bool,
    ) -> Self {
        Self {
            ledger,
            store,
            modules,
            refresh_from_views,
        }
    }

    /// Apply `event`, emitted by the operation at `version`
    pub async fn apply(
        &self,
        event: &LedgerEvent,
        version: Version,
    ) -> Result<ApplyOutcome, IndexerError> {
        let Some(kind) = EventKind::from_name(event.name()) else {
            return Ok(ApplyOutcome::Ignored);
        };

        let data = if self.refresh_from_views {
            self.refresh(kind, &event.data).await
        } else {
            Cow::Borrowed(&event.data)
        };

        let domain = DomainEvent::decode(kind, &data)?;
        self.write(domain, version).await
    }

    /// Overlay the canonical record, if there is one, on the payload
    async fn refresh<'a>(&self, kind: EventKind, data: &'a Value) -> Cow<'a, Value> {
        let Some((module, function, args)) = self.canonical_view(kind, data) else {
            return Cow::Borrowed(data);
        };

        match self.ledger.view(&module, function, args).await {
            Ok(value) => match first_return(&value) {
                Value::Object(fields) => {
                    let mut merged: Map<String, Value> =
                        data.as_object().cloned().unwrap_or_default();
                    for (name, field) in fields {
                        if !field.is_null() {
                            merged.insert(name.clone(), field.clone());
                        }
                    }
                    Cow::Owned(Value::Object(merged))
                }
                _ => Cow::Borrowed(data),
            },
            Err(e) => {
                debug!(
                    event = kind.as_str(),
                    error = %e,
                    "Canonical view unavailable, using event payload"
                );
                Cow::Borrowed(data)
            }
        }
    }

    fn canonical_view(
        &self,
        kind: EventKind,
        data: &Value,
    ) -> Option<(String, &'static str, Vec<Value>)> {
        let id_arg = |field: &str| value_as_u64(&data[field]).map(|id| Value::String(id.to_string()));
        let address = |field: &str| data[field].as_str().and_then(|raw| Address::parse(raw).ok());

        match kind {
            EventKind::ProviderRegistered | EventKind::ProviderUpdated => {
                let provider = address("provider")?;
                Some((
                    self.modules.provider_module(),
                    functions::GET_PROVIDER,
                    vec![Value::String(provider.to_string())],
                ))
            }
            EventKind::JobCreated => Some((
                self.modules.job_module(),
                functions::GET_JOB,
                vec![id_arg("job_id")?],
            )),
            EventKind::EscrowCreated => Some((
                self.modules.escrow_module(),
                functions::GET_ESCROW,
                vec![id_arg("escrow_id")?],
            )),
            EventKind::StreamCreated | EventKind::PaymentProcessed => {
                let key = StreamKey::new(address("payer")?, value_as_u64(&data["job_id"])?);
                Some((
                    self.modules.payment_module(),
                    functions::GET_STREAM,
                    key.ledger_args(),
                ))
            }
            _ => None,
        }
    }

    async fn write(
        &self,
        event: DomainEvent,
        version: Version,
    ) -> Result<ApplyOutcome, IndexerError> {
        let store = &self.store;
        let touched = match event {
            DomainEvent::ProviderRegistered(p) | DomainEvent::ProviderUpdated(p) => {
                store
                    .upsert_provider(&ProviderRecord {
                        address: p.address,
                        name: p.name,
                        endpoint: p.endpoint,
                        gpu_model: p.gpu_model,
                        gpu_count: p.gpu_count,
                        price_per_second: p.price_per_second,
                        is_active: p.is_active,
                        updated_version: version,
                    })
                    .await?;
                true
            }
            DomainEvent::ProviderDeactivated { address } => {
                store.set_provider_active(&address, false, version).await?
            }

            DomainEvent::JobCreated(j) => {
                // Without an explicit status, keep whatever the mirror already has
                let existing = store.get_job(j.job_id).await?.map(|job| job.status);
                let status = j
                    .status
                    .and_then(JobStatus::from_id)
                    .or(existing)
                    .unwrap_or(JobStatus::Pending);
                store
                    .upsert_job(&JobRecord {
                        job_id: j.job_id,
                        buyer: j.buyer,
                        provider: j.provider,
                        status,
                        max_duration_secs: j.max_duration_secs,
                        price_per_second: j.price_per_second,
                        created_at: j.created_at,
                        created_version: version,
                        updated_version: version,
                    })
                    .await?;
                true
            }
            DomainEvent::JobStarted { job_id } => {
                store.update_job_status(job_id, JobStatus::Running, version).await?
            }
            DomainEvent::JobCompleted { job_id } => {
                store.update_job_status(job_id, JobStatus::Completed, version).await?
            }
            DomainEvent::JobCancelled { job_id } => {
                store.update_job_status(job_id, JobStatus::Cancelled, version).await?
            }

            DomainEvent::EscrowCreated(e) => {
                let existing = store.get_escrow(e.escrow_id).await?.map(|esc| esc.status);
                let status = e
                    .status
                    .and_then(EscrowStatus::from_id)
                    .or(existing)
                    .unwrap_or(EscrowStatus::Locked);
                store
                    .upsert_escrow(&EscrowRecord {
                        escrow_id: e.escrow_id,
                        job_id: e.job_id,
                        buyer: e.buyer,
                        provider: e.provider,
                        amount: e.amount,
                        status,
                        updated_version: version,
                    })
                    .await?;
                true
            }
            DomainEvent::EscrowReleased { escrow_id } => {
                store
                    .update_escrow_status(escrow_id, EscrowStatus::Released, version)
                    .await?
            }
            DomainEvent::EscrowRefunded { escrow_id } => {
                store
                    .update_escrow_status(escrow_id, EscrowStatus::Refunded, version)
                    .await?
            }

            DomainEvent::StreamCreated(s) => {
                store
                    .upsert_stream(&StreamRecord {
                        payer: s.key.payer,
                        job_id: s.key.job_id,
                        payee: s.payee,
                        rate_per_second: s.rate_per_second,
                        start_time: s.start_time,
                        total_accrued: s.total_accrued,
                        is_active: s.is_active,
                        is_paused: s.is_paused,
                        last_processed_at: s.last_processed_at,
                        updated_version: version,
                    })
                    .await?;
                true
            }
            DomainEvent::PaymentProcessed {
                key,
                total_accrued,
                processed_at,
            } => {
                store
                    .record_accrual(&key, total_accrued, processed_at, version)
                    .await?
            }
            DomainEvent::StreamPaused { key } => store.pause_stream(&key, version).await?,
            DomainEvent::StreamResumed { key } => store.resume_stream(&key, version).await?,
            DomainEvent::StreamClosed { key, final_accrued } => {
                store.close_stream(&key, final_accrued, version).await?
            }
        };

        Ok(if touched {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::NotMirrored
        })
    }
}
