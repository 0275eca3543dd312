//! Core types used throughout the system
//!
//! Type aliases give ledger integers semantic meaning; [`StreamKey`] is the
//! one place a stream identity is constructed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ledger::{Address, AddressError};

/// Job ID - assigned sequentially by the job registry contract.
pub type JobId = u64;

/// Escrow ID - assigned sequentially by the escrow contract.
pub type EscrowId = u64;

/// Position in the ledger's global operation sequence.
///
/// # Constraints:
/// - **Monotonic**: later operations always carry a higher version
/// - **Sparse per account**: an account's history skips most versions
pub type Version = u64;

/// Amount in the ledger's smallest coin unit
pub type Amount = u64;

/// Identity of a payment stream: one stream per (payer, job).
///
/// Both parts are already canonical ([`Address`] normalizes on parse), so
/// equality and hashing never depend on how a caller spelled the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub payer: Address,
    pub job_id: JobId,
}

impl StreamKey {
    pub fn new(payer: Address, job_id: JobId) -> Self {
        Self { payer, job_id }
    }

    /// Build a key from an unnormalized address string
    pub fn parse(payer: &str, job_id: JobId) -> Result<Self, AddressError> {
        Ok(Self::new(Address::parse(payer)?, job_id))
    }

    /// Arguments identifying this stream in ledger calls
    pub fn ledger_args(&self) -> Vec<serde_json::Value> {
        vec![
            serde_json::Value::String(self.payer.to_string()),
            serde_json::Value::String(self.job_id.to_string()),
        ]
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.payer, self.job_id)
    }
}
