//! Ledger sync indexer
//!
//! - [`sync`] - cursor-driven history replay
//! - [`handlers`] - one event to one idempotent mirror write
//! - [`events`] - typed decoding of ledger event payloads
//! - [`recovery`] - best-effort job id recovery

pub mod error;
pub mod events;
pub mod handlers;
pub mod recovery;
pub mod sync;

pub use error::IndexerError;
pub use events::{DomainEvent, EventKind};
pub use handlers::{ApplyOutcome, EventApplier};
pub use recovery::{Recovered, reconcile_with_mirror, recover_job_id};
pub use sync::{IndexerStatus, LedgerSyncIndexer, SyncOutcome, SyncReport};
