//! Domain events
//!
//! Typed view of the ledger events the mirror cares about. Decoding is
//! lenient for descriptive fields (default plus a warning) and strict for
//! the identity fields an upsert is keyed on.

use serde_json::Value;
use tracing::warn;

use super::error::IndexerError;
use crate::core_types::{Amount, EscrowId, JobId, StreamKey};
use crate::ledger::Address;
use crate::ledger::types::{value_as_bool, value_as_u64};
use crate::store::StreamRecord;

/// Event types the indexer dispatches on, by trailing type name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProviderRegistered,
    ProviderUpdated,
    ProviderDeactivated,
    JobCreated,
    JobStarted,
    JobCompleted,
    JobCancelled,
    EscrowCreated,
    EscrowReleased,
    EscrowRefunded,
    StreamCreated,
    PaymentProcessed,
    StreamPaused,
    StreamResumed,
    StreamClosed,
}

impl EventKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "ProviderRegistered" => EventKind::ProviderRegistered,
            "ProviderUpdated" => EventKind::ProviderUpdated,
            "ProviderDeactivated" => EventKind::ProviderDeactivated,
            "JobCreated" => EventKind::JobCreated,
            "JobStarted" => EventKind::JobStarted,
            "JobCompleted" => EventKind::JobCompleted,
            "JobCancelled" => EventKind::JobCancelled,
            "EscrowCreated" => EventKind::EscrowCreated,
            "EscrowReleased" => EventKind::EscrowReleased,
            "EscrowRefunded" => EventKind::EscrowRefunded,
            "StreamCreated" => EventKind::StreamCreated,
            "PaymentProcessed" => EventKind::PaymentProcessed,
            "StreamPaused" => EventKind::StreamPaused,
            "StreamResumed" => EventKind::StreamResumed,
            "StreamClosed" => EventKind::StreamClosed,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProviderRegistered => "ProviderRegistered",
            EventKind::ProviderUpdated => "ProviderUpdated",
            EventKind::ProviderDeactivated => "ProviderDeactivated",
            EventKind::JobCreated => "JobCreated",
            EventKind::JobStarted => "JobStarted",
            EventKind::JobCompleted => "JobCompleted",
            EventKind::JobCancelled => "JobCancelled",
            EventKind::EscrowCreated => "EscrowCreated",
            EventKind::EscrowReleased => "EscrowReleased",
            EventKind::EscrowRefunded => "EscrowRefunded",
            EventKind::StreamCreated => "StreamCreated",
            EventKind::PaymentProcessed => "PaymentProcessed",
            EventKind::StreamPaused => "StreamPaused",
            EventKind::StreamResumed => "StreamResumed",
            EventKind::StreamClosed => "StreamClosed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFields {
    pub address: Address,
    pub name: String,
    pub endpoint: String,
    pub gpu_model: String,
    pub gpu_count: u32,
    pub price_per_second: Amount,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFields {
    pub job_id: JobId,
    pub buyer: Address,
    pub provider: Address,
    /// Raw status id, if the payload or view carried one
    pub status: Option<i16>,
    pub max_duration_secs: u64,
    pub price_per_second: Amount,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowFields {
    pub escrow_id: EscrowId,
    pub job_id: JobId,
    pub buyer: Address,
    pub provider: Address,
    pub amount: Amount,
    pub status: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFields {
    pub key: StreamKey,
    pub payee: Address,
    pub rate_per_second: Amount,
    pub start_time: i64,
    pub total_accrued: Amount,
    pub is_active: bool,
    pub is_paused: bool,
    pub last_processed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    ProviderRegistered(ProviderFields),
    ProviderUpdated(ProviderFields),
    ProviderDeactivated { address: Address },
    JobCreated(JobFields),
    JobStarted { job_id: JobId },
    JobCompleted { job_id: JobId },
    JobCancelled { job_id: JobId },
    EscrowCreated(EscrowFields),
    EscrowReleased { escrow_id: EscrowId },
    EscrowRefunded { escrow_id: EscrowId },
    StreamCreated(StreamFields),
    PaymentProcessed {
        key: StreamKey,
        total_accrued: Amount,
        processed_at: Option<i64>,
    },
    StreamPaused { key: StreamKey },
    StreamResumed { key: StreamKey },
    StreamClosed {
        key: StreamKey,
        final_accrued: Option<Amount>,
    },
}

impl DomainEvent {
    /// Decode `data` as an event of `kind`
    pub fn decode(kind: EventKind, data: &Value) -> Result<Self, IndexerError> {
        let p = Payload { kind, data };
        Ok(match kind {
            EventKind::ProviderRegistered => DomainEvent::ProviderRegistered(p.provider()?),
            EventKind::ProviderUpdated => DomainEvent::ProviderUpdated(p.provider()?),
            EventKind::ProviderDeactivated => DomainEvent::ProviderDeactivated {
                address: p.address("provider")?,
            },
            EventKind::JobCreated => DomainEvent::JobCreated(JobFields {
                job_id: p.id("job_id")?,
                buyer: p.address("buyer")?,
                provider: p.address("provider")?,
                status: p.opt_narrow("status")?,
                max_duration_secs: p.u64_or_zero("max_duration"),
                price_per_second: p.u64_or_zero("price_per_second"),
                created_at: p.narrow_or_zero("created_at")?,
            }),
            EventKind::JobStarted => DomainEvent::JobStarted {
                job_id: p.id("job_id")?,
            },
            EventKind::JobCompleted => DomainEvent::JobCompleted {
                job_id: p.id("job_id")?,
            },
            EventKind::JobCancelled => DomainEvent::JobCancelled {
                job_id: p.id("job_id")?,
            },
            EventKind::EscrowCreated => DomainEvent::EscrowCreated(EscrowFields {
                escrow_id: p.id("escrow_id")?,
                job_id: p.u64_or_zero("job_id"),
                buyer: p.address("buyer")?,
                provider: p.address("provider")?,
                amount: p.u64_or_zero("amount"),
                status: p.opt_narrow("status")?,
            }),
            EventKind::EscrowReleased => DomainEvent::EscrowReleased {
                escrow_id: p.id("escrow_id")?,
            },
            EventKind::EscrowRefunded => DomainEvent::EscrowRefunded {
                escrow_id: p.id("escrow_id")?,
            },
            EventKind::StreamCreated => {
                let (is_active, is_paused) = StreamRecord::normalize_flags(
                    p.bool_or("is_active", true),
                    p.bool_or("is_paused", false),
                );
                DomainEvent::StreamCreated(StreamFields {
                    key: p.stream_key()?,
                    payee: p.address("payee")?,
                    rate_per_second: p.u64_or_zero("rate_per_second"),
                    start_time: p.narrow_or_zero("start_time")?,
                    total_accrued: p.opt_u64("total_accrued").unwrap_or(0),
                    is_active,
                    is_paused,
                    last_processed_at: p.opt_narrow("last_processed_at")?,
                })
            }
            EventKind::PaymentProcessed => DomainEvent::PaymentProcessed {
                key: p.stream_key()?,
                total_accrued: p.u64_or_zero("total_accrued"),
                processed_at: p.opt_narrow("timestamp")?,
            },
            EventKind::StreamPaused => DomainEvent::StreamPaused {
                key: p.stream_key()?,
            },
            EventKind::StreamResumed => DomainEvent::StreamResumed {
                key: p.stream_key()?,
            },
            EventKind::StreamClosed => DomainEvent::StreamClosed {
                key: p.stream_key()?,
                final_accrued: p.opt_u64("total_accrued"),
            },
        })
    }
}

/// Field access over one event payload
struct Payload<'a> {
    kind: EventKind,
    data: &'a Value,
}

impl Payload<'_> {
    fn malformed(&self, field: &'static str) -> IndexerError {
        IndexerError::MalformedEvent {
            event: self.kind.as_str(),
            field,
        }
    }

    fn id(&self, field: &'static str) -> Result<u64, IndexerError> {
        value_as_u64(&self.data[field]).ok_or_else(|| self.malformed(field))
    }

    fn address(&self, field: &'static str) -> Result<Address, IndexerError> {
        self.data[field]
            .as_str()
            .and_then(|raw| Address::parse(raw).ok())
            .ok_or_else(|| self.malformed(field))
    }

    fn stream_key(&self) -> Result<StreamKey, IndexerError> {
        Ok(StreamKey::new(self.address("payer")?, self.id("job_id")?))
    }

    fn opt_u64(&self, field: &str) -> Option<u64> {
        value_as_u64(&self.data[field])
    }

    fn u64_or_zero(&self, field: &str) -> u64 {
        self.opt_u64(field).unwrap_or_else(|| {
            self.warn_default(field);
            0
        })
    }

    /// Optional numeric field that must fit `T` when present
    fn opt_narrow<T: TryFrom<u64>>(&self, field: &'static str) -> Result<Option<T>, IndexerError> {
        self.opt_u64(field)
            .map(|v| T::try_from(v).map_err(|_| self.malformed(field)))
            .transpose()
    }

    fn narrow_or_zero<T: TryFrom<u64>>(&self, field: &'static str) -> Result<T, IndexerError> {
        T::try_from(self.u64_or_zero(field)).map_err(|_| self.malformed(field))
    }

    fn string_or_empty(&self, field: &str) -> String {
        match self.data[field].as_str() {
            Some(s) => s.to_string(),
            None => {
                self.warn_default(field);
                String::new()
            }
        }
    }

    fn bool_or(&self, field: &str, default: bool) -> bool {
        match &self.data[field] {
            Value::Null => default,
            v => value_as_bool(v).unwrap_or_else(|| {
                self.warn_default(field);
                default
            }),
        }
    }

    fn warn_default(&self, field: &str) {
        warn!(event = self.kind.as_str(), field, "Missing or malformed field, using default");
    }

    fn provider(&self) -> Result<ProviderFields, IndexerError> {
        Ok(ProviderFields {
            address: self.address("provider")?,
            name: self.string_or_empty("name"),
            endpoint: self.string_or_empty("endpoint"),
            gpu_model: self.string_or_empty("gpu_model"),
            gpu_count: self.narrow_or_zero("gpu_count")?,
            price_per_second: self.u64_or_zero("price_per_second"),
            is_active: self.bool_or("is_active", true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_job_created() {
        let data = json!({
            "job_id": "7",
            "buyer": "0xB0",
            "provider": "0xa1",
            "max_duration": 3600,
            "price_per_second": "25",
            "created_at": "1700000000",
        });
        let event = DomainEvent::decode(EventKind::JobCreated, &data).unwrap();
        let DomainEvent::JobCreated(job) = event else {
            panic!("wrong variant");
        };
        assert_eq!(job.job_id, 7);
        assert_eq!(job.buyer, Address::parse("0xb0").unwrap());
        assert_eq!(job.max_duration_secs, 3600);
        assert_eq!(job.price_per_second, 25);
        assert_eq!(job.status, None);
    }

    #[test]
    fn test_missing_key_field_is_malformed() {
        let err = DomainEvent::decode(EventKind::EscrowReleased, &json!({})).unwrap_err();
        assert!(matches!(
            err,
            IndexerError::MalformedEvent {
                event: "EscrowReleased",
                field: "escrow_id"
            }
        ));
    }

    #[test]
    fn test_descriptive_fields_default() {
        let data = json!({ "provider": "0x1", "gpu_count": "lots" });
        let DomainEvent::ProviderRegistered(p) =
            DomainEvent::decode(EventKind::ProviderRegistered, &data).unwrap()
        else {
            panic!("wrong variant");
        };
        assert_eq!(p.name, "");
        assert_eq!(p.gpu_count, 0);
        assert!(p.is_active);
    }

    #[test]
    fn test_stream_created_flags() {
        let decode = |is_active: bool, is_paused: bool| {
            let data = json!({
                "payer": "0xa",
                "payee": "0xb",
                "job_id": 1,
                "is_active": is_active,
                "is_paused": is_paused,
            });
            match DomainEvent::decode(EventKind::StreamCreated, &data).unwrap() {
                DomainEvent::StreamCreated(s) => (s.is_active, s.is_paused),
                other => panic!("wrong variant: {:?}", other),
            }
        };
        assert_eq!(decode(true, false), (true, false));
        assert_eq!(decode(false, true), (false, true));
        assert_eq!(decode(false, false), (false, false));
        // Paused wins over a stale active flag
        assert_eq!(decode(true, true), (false, true));
    }

    #[test]
    fn test_out_of_range_numbers_are_malformed() {
        let job = json!({
            "job_id": "7",
            "buyer": "0xb0",
            "provider": "0xa1",
            "status": 65538,
        });
        let err = DomainEvent::decode(EventKind::JobCreated, &job).unwrap_err();
        assert!(matches!(
            err,
            IndexerError::MalformedEvent {
                event: "JobCreated",
                field: "status"
            }
        ));

        let provider = json!({ "provider": "0x1", "gpu_count": "4294967296" });
        let err = DomainEvent::decode(EventKind::ProviderRegistered, &provider).unwrap_err();
        assert!(matches!(err, IndexerError::MalformedEvent { field: "gpu_count", .. }));

        let payment = json!({
            "payer": "0xa",
            "job_id": 1,
            "total_accrued": "5",
            "timestamp": u64::MAX.to_string(),
        });
        let err = DomainEvent::decode(EventKind::PaymentProcessed, &payment).unwrap_err();
        assert!(matches!(err, IndexerError::MalformedEvent { field: "timestamp", .. }));
    }

    #[test]
    fn test_kind_names_roundtrip() {
        for name in ["JobCreated", "StreamClosed", "ProviderDeactivated"] {
            assert_eq!(EventKind::from_name(name).unwrap().as_str(), name);
        }
        assert!(EventKind::from_name("CoinDeposited").is_none());
    }
}
