//! Streaming payments
//!
//! - [`registry`] - in-memory set of streams under management
//! - [`orchestrator`] - periodic claim fan-out over the registry

pub mod orchestrator;
pub mod registry;

pub use orchestrator::{
    OrchestratorConfig, OrchestratorStatus, PaymentOrchestrator, TickOutcome, TickReport,
};
pub use registry::{ActiveStreamRegistration, StreamRegistry};
