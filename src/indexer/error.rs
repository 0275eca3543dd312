use thiserror::Error;

use crate::ledger::LedgerError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed {event} event: missing or invalid `{field}`")]
    MalformedEvent {
        event: &'static str,
        field: &'static str,
    },
}

impl IndexerError {
    pub fn code(&self) -> &'static str {
        match self {
            IndexerError::Ledger(e) => e.kind.code(),
            IndexerError::Store(e) => e.code(),
            IndexerError::MalformedEvent { .. } => "MALFORMED_EVENT",
        }
    }
}
