//! Ledger value types shared by the client, the orchestrator and the indexer.

use std::fmt;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Length of a canonical account address in hex digits (32 bytes).
const ADDRESS_HEX_LEN: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Address too long: {0} hex digits")]
    TooLong(usize),

    #[error("Address contains non-hex characters: {0}")]
    NotHex(String),
}

/// Canonical ledger account address.
///
/// The only way to build one is [`Address::parse`], which lowercases and
/// left-pads to 32 bytes. `0xAB`, `0xab` and `0x00..ab` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() {
            return Err(AddressError::Empty);
        }
        if digits.len() > ADDRESS_HEX_LEN {
            return Err(AddressError::TooLong(digits.len()));
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::NotHex(raw.to_string()));
        }

        Ok(Self(format!(
            "0x{:0>width$}",
            digits.to_ascii_lowercase(),
            width = ADDRESS_HEX_LEN
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Hash of a submitted operation as reported by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub String);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signing credentials for one payer account.
///
/// The key never leaves the process; `Debug` only prints the address.
#[derive(Clone)]
pub struct Credentials {
    address: Address,
    signing_key: SigningKey,
}

impl Credentials {
    pub fn new(address: Address, signing_key: SigningKey) -> Self {
        Self {
            address,
            signing_key,
        }
    }

    /// Build credentials from a hex-encoded 32-byte Ed25519 private key
    pub fn from_hex(address: Address, private_key_hex: &str) -> Result<Self, CredentialsError> {
        let raw = private_key_hex.trim_start_matches("0x");
        let bytes = hex::decode(raw).map_err(|e| CredentialsError::InvalidHex(e.to_string()))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CredentialsError::InvalidLength(bytes.len()))?;
        Ok(Self::new(address, SigningKey::from_bytes(&key)))
    }

    /// Random key for tests and local dry runs
    #[cfg(any(test, feature = "mock-ledger"))]
    pub fn generate(address: Address) -> Self {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::new(address, signing_key)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("Private key is not valid hex: {0}")]
    InvalidHex(String),

    #[error("Private key must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// One event emitted by a ledger operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Fully qualified type, e.g. `0x1::escrow::EscrowCreated`
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl LedgerEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// Trailing type name with any generic arguments removed.
    ///
    /// `0x1::stream_payment::StreamClosed<0x1::coin::Coin>` -> `StreamClosed`
    pub fn name(&self) -> &str {
        let base = self
            .event_type
            .split_once('<')
            .map(|(head, _)| head)
            .unwrap_or(&self.event_type);
        base.rsplit("::").next().unwrap_or(base)
    }
}

/// One committed operation touching the tracked account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerOperation {
    pub version: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub events: Vec<LedgerEvent>,
}

/// View functions return a list of return values; most callers want the first.
pub fn first_return(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}

/// Ledger integers are frequently serialized as decimal strings.
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
