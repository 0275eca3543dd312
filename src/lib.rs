//! gpu_market_sync - ledger-facing core of a GPU compute rental marketplace
//!
//! Keeps the off-ledger view consistent with an append-only ledger under
//! polling, partial failure and crash-restart.
//!
//! # Modules
//!
//! - [`core_types`] - Ids, versions and the stream key
//! - [`ledger`] - Ledger client trait, JSON-RPC implementation, scripted mock
//! - [`store`] - Mirror store and sync cursor (PostgreSQL, in-memory)
//! - [`payments`] - Stream registry and the payment orchestrator
//! - [`indexer`] - Ledger history replay into the mirror
//! - [`scheduler`] - Tick sources and the single-flight guard
//! - [`service`] - Lifecycle and status surface
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod indexer;
pub mod ledger;
pub mod logging;
pub mod payments;
pub mod scheduler;
pub mod service;
pub mod store;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{Amount, EscrowId, JobId, StreamKey, Version};
pub use indexer::{IndexerStatus, LedgerSyncIndexer, SyncOutcome, SyncReport};
pub use ledger::{Address, Credentials, LedgerClient, LedgerError, LedgerErrorKind};
pub use payments::{OrchestratorStatus, PaymentOrchestrator, StreamRegistry, TickOutcome, TickReport};
pub use service::{ServiceError, ServiceStatus, SyncService};
pub use store::{CursorStore, MemoryStore, MirrorStore, PgMirrorStore};
