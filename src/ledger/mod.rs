//! Ledger Client
//!
//! The external append-only ledger is reached only through [`LedgerClient`]:
//! submit a signed operation, call a view function, read the head version,
//! and page through an account's operation history.
//!
//! - [`rpc`] - JSON-RPC gateway implementation (production)
//! - [`mock`] - scripted in-process ledger (tests, dry runs)

pub mod client;
pub mod error;
#[cfg(any(test, feature = "mock-ledger"))]
pub mod mock;
pub mod retry;
pub mod rpc;
pub mod signing;
pub mod types;

// Re-exports for convenience
pub use client::{LedgerClient, LedgerModules, functions};
pub use error::{LedgerError, LedgerErrorKind};
#[cfg(any(test, feature = "mock-ledger"))]
pub use mock::MockLedgerClient;
pub use retry::RetryPolicy;
pub use rpc::RpcLedgerClient;
pub use types::{
    Address, AddressError, Credentials, CredentialsError, LedgerEvent, LedgerOperation,
    OperationId,
};
