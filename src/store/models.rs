//! Mirror entities
//!
//! Off-ledger copies of ledger state, keyed by natural domain id.
//! `updated_version` records the ledger version that last touched the row.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core_types::{Amount, EscrowId, JobId, StreamKey, Version};
use crate::ledger::Address;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub address: Address,
    pub name: String,
    pub endpoint: String,
    pub gpu_model: String,
    pub gpu_count: u32,
    pub price_per_second: Amount,
    pub is_active: bool,
    pub updated_version: Version,
}

/// Job lifecycle as stored by the job registry contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum JobStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Cancelled = 3,
}

impl JobStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(JobStatus::Pending),
            1 => Some(JobStatus::Running),
            2 => Some(JobStatus::Completed),
            3 => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub buyer: Address,
    pub provider: Address,
    pub status: JobStatus,
    pub max_duration_secs: u64,
    pub price_per_second: Amount,
    /// Ledger timestamp (seconds)
    pub created_at: i64,
    /// Version of the operation that emitted `JobCreated`
    pub created_version: Version,
    pub updated_version: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum EscrowStatus {
    Locked = 0,
    Released = 1,
    Refunded = 2,
}

impl EscrowStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(EscrowStatus::Locked),
            1 => Some(EscrowStatus::Released),
            2 => Some(EscrowStatus::Refunded),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EscrowStatus::Locked)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Locked => "LOCKED",
            EscrowStatus::Released => "RELEASED",
            EscrowStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub escrow_id: EscrowId,
    pub job_id: JobId,
    pub buyer: Address,
    pub provider: Address,
    pub amount: Amount,
    pub status: EscrowStatus,
    pub updated_version: Version,
}

/// Mirrored payment stream.
///
/// | state  | `is_active` | `is_paused` |
/// |--------|-------------|-------------|
/// | active | true        | false       |
/// | paused | false       | true        |
/// | closed | false       | false       |
///
/// # Invariants
/// - `is_active && is_paused` never holds
/// - `total_accrued` never decreases
/// - closed is terminal: no transition leaves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub payer: Address,
    pub job_id: JobId,
    pub payee: Address,
    pub rate_per_second: Amount,
    /// Ledger timestamp (seconds)
    pub start_time: i64,
    pub total_accrued: Amount,
    pub is_active: bool,
    pub is_paused: bool,
    /// Ledger timestamp of the last processed payment
    pub last_processed_at: Option<i64>,
    pub updated_version: Version,
}

impl StreamRecord {
    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.payer.clone(), self.job_id)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        !self.is_active && !self.is_paused
    }

    /// Map raw `(is_active, is_paused)` flags onto a valid state.
    ///
    /// A pause reported alongside an active flag is a pause.
    #[inline]
    pub fn normalize_flags(is_active: bool, is_paused: bool) -> (bool, bool) {
        (is_active && !is_paused, is_paused)
    }

    /// Fold `incoming` into `self` without breaking the stream invariants.
    ///
    /// Used by every store implementation so replay converges identically.
    pub fn merge(&mut self, incoming: &StreamRecord) {
        let was_closed = self.is_closed();

        self.payee = incoming.payee.clone();
        self.rate_per_second = incoming.rate_per_second;
        self.start_time = incoming.start_time;
        self.total_accrued = self.total_accrued.max(incoming.total_accrued);
        self.last_processed_at = match (self.last_processed_at, incoming.last_processed_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.updated_version = self.updated_version.max(incoming.updated_version);

        if was_closed {
            self.is_active = false;
            self.is_paused = false;
        } else {
            (self.is_active, self.is_paused) =
                Self::normalize_flags(incoming.is_active, incoming.is_paused);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(total: u64, active: bool, paused: bool) -> StreamRecord {
        StreamRecord {
            payer: Address::parse("0xa").unwrap(),
            job_id: 1,
            payee: Address::parse("0xb").unwrap(),
            rate_per_second: 100,
            start_time: 1_700_000_000,
            total_accrued: total,
            is_active: active,
            is_paused: paused,
            last_processed_at: None,
            updated_version: 1,
        }
    }

    #[test]
    fn test_status_ids_roundtrip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_id(s.id()), Some(s));
        }
        assert_eq!(JobStatus::from_id(9), None);
        assert!(EscrowStatus::Refunded.is_terminal());
        assert!(!EscrowStatus::Locked.is_terminal());
    }

    #[test]
    fn test_merge_never_lowers_accrual() {
        let mut s = stream(500, true, false);
        s.merge(&stream(300, true, false));
        assert_eq!(s.total_accrued, 500);

        s.merge(&stream(900, true, false));
        assert_eq!(s.total_accrued, 900);
    }

    #[test]
    fn test_merge_closed_is_terminal() {
        let mut s = stream(500, false, false);
        s.merge(&stream(600, true, false));
        assert!(s.is_closed());
        assert_eq!(s.total_accrued, 600);
    }

    #[test]
    fn test_merge_pause_and_resume() {
        let mut s = stream(0, true, false);
        s.merge(&stream(0, false, true));
        assert!(!s.is_active);
        assert!(s.is_paused);
        assert!(!s.is_closed());

        s.merge(&stream(0, true, false));
        assert!(s.is_active);
        assert!(!s.is_paused);
    }

    #[test]
    fn test_merge_never_active_and_paused() {
        let mut s = stream(0, true, false);
        s.merge(&stream(0, true, true));
        assert!(!(s.is_active && s.is_paused));
        assert!(s.is_paused);
    }

    #[test]
    fn test_merge_paused_then_closed_is_terminal() {
        let mut s = stream(0, false, true);
        s.merge(&stream(0, false, false));
        assert!(s.is_closed());

        s.merge(&stream(0, false, true));
        assert!(s.is_closed());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let incoming = stream(700, true, true);
        let mut once = stream(100, true, false);
        once.merge(&incoming);
        let mut twice = once.clone();
        twice.merge(&incoming);
        assert_eq!(once, twice);
    }
}
