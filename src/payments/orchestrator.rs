//! Payment Orchestrator
//!
//! On every tick, submits one `process_payment` claim per registered stream.
//!
//! # Per-stream flow
//! 1. Liveness view. Closed or missing streams are pruned without a claim;
//!    paused streams are skipped and stay registered.
//! 2. Claim with the payer's credentials.
//! 3. Classify: success marks the stream processed, a definitive "gone"
//!    prunes it, everything else keeps it for the next tick.
//!
//! A tick never fails. Outcomes are folded into a [`TickReport`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::registry::{ActiveStreamRegistration, StreamRegistry};
use crate::config::PaymentsConfig;
use crate::core_types::StreamKey;
use crate::ledger::types::{first_return, value_as_bool};
use crate::ledger::{Credentials, LedgerClient, LedgerErrorKind, LedgerModules, functions};
use crate::scheduler::SingleFlight;

/// Tunables for one orchestrator instance
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Claims in flight at once
    pub batch_size: usize,
    /// Skip a stream claimed less than this long ago
    pub min_claim_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            min_claim_interval: Duration::ZERO,
        }
    }
}

impl From<&PaymentsConfig> for OrchestratorConfig {
    fn from(config: &PaymentsConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            min_claim_interval: Duration::from_millis(config.min_claim_interval_ms),
        }
    }
}

/// Counters for one completed tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub pruned: usize,
    pub retained_with_error: usize,
    pub paused: usize,
    pub not_due: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still running
    Skipped,
    Completed(TickReport),
}

/// What happened to one stream during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamResult {
    Claimed,
    Pruned,
    Paused,
    NotDue,
    Retained(LedgerErrorKind),
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub active_stream_count: usize,
    pub active_stream_keys: Vec<StreamKey>,
}

pub struct PaymentOrchestrator {
    registry: StreamRegistry,
    ledger: Arc<dyn LedgerClient>,
    modules: LedgerModules,
    config: OrchestratorConfig,
    flight: SingleFlight,
    running: AtomicBool,
}

impl PaymentOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        modules: LedgerModules,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry: StreamRegistry::new(),
            ledger,
            modules,
            config,
            flight: SingleFlight::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Start managing a stream. Idempotent; returns `true` if newly added.
    pub fn register_stream(
        &self,
        key: StreamKey,
        payee: crate::ledger::Address,
        rate_per_second: u64,
        credentials: Credentials,
    ) -> bool {
        let added = self.registry.register(ActiveStreamRegistration::new(
            key.clone(),
            payee,
            rate_per_second,
            credentials,
        ));
        info!(stream = %key, added, "Stream registered");
        added
    }

    /// Stop managing a stream. Idempotent; returns `true` if it was registered.
    pub fn unregister_stream(&self, key: &StreamKey) -> bool {
        let removed = self.registry.unregister(key);
        if removed {
            info!(stream = %key, "Stream unregistered");
        }
        removed
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// A tick body is currently executing
    pub fn is_busy(&self) -> bool {
        self.flight.is_busy()
    }

    pub fn status(&self) -> OrchestratorStatus {
        let keys = self.registry.keys();
        OrchestratorStatus {
            running: self.running.load(Ordering::SeqCst),
            active_stream_count: keys.len(),
            active_stream_keys: keys,
        }
    }

    /// Run one pass over every registered stream.
    ///
    /// Returns [`TickOutcome::Skipped`] without touching the ledger if a
    /// previous tick is still in flight.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Payment tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let snapshot = self.registry.snapshot();
        let mut report = TickReport::default();
        if snapshot.is_empty() {
            return TickOutcome::Completed(report);
        }

        let now = Utc::now();
        for batch in snapshot.chunks(self.config.batch_size.max(1)) {
            let results = join_all(batch.iter().map(|reg| self.process_stream(reg, now))).await;

            for result in results {
                match result {
                    StreamResult::Claimed => report.claimed += 1,
                    StreamResult::Pruned => report.pruned += 1,
                    StreamResult::Paused => report.paused += 1,
                    StreamResult::NotDue => report.not_due += 1,
                    StreamResult::Retained(_) => report.retained_with_error += 1,
                }
            }
        }

        info!(
            streams = snapshot.len(),
            claimed = report.claimed,
            pruned = report.pruned,
            retained_with_error = report.retained_with_error,
            paused = report.paused,
            "Payment tick completed"
        );

        TickOutcome::Completed(report)
    }

    async fn process_stream(
        &self,
        reg: &ActiveStreamRegistration,
        now: DateTime<Utc>,
    ) -> StreamResult {
        let key = &reg.key;

        if let Some(last) = reg.last_processed_at
            && !self.config.min_claim_interval.is_zero()
            && (now - last).to_std().unwrap_or_default() < self.config.min_claim_interval
        {
            debug!(stream = %key, "Claim not due yet");
            return StreamResult::NotDue;
        }

        let payment_module = self.modules.payment_module();

        // 1. Liveness
        match self
            .ledger
            .view(&payment_module, functions::GET_STREAM, key.ledger_args())
            .await
        {
            Ok(value) => {
                let stream = first_return(&value);
                let is_active = value_as_bool(&stream["is_active"]).unwrap_or(true);
                let is_paused = value_as_bool(&stream["is_paused"]).unwrap_or(false);

                // Paused is inactive but not closed
                if is_paused {
                    debug!(stream = %key, "Stream paused, no claim this tick");
                    return StreamResult::Paused;
                }
                if !is_active {
                    self.prune(reg, "stream closed on ledger");
                    return StreamResult::Pruned;
                }
            }
            Err(e) if e.kind.is_definitive_gone() => {
                self.prune(reg, e.kind.code());
                return StreamResult::Pruned;
            }
            Err(e) => {
                warn!(stream = %key, error = %e, "Liveness check failed, keeping stream");
                return StreamResult::Retained(e.kind);
            }
        }

        // 2. Claim
        let result = self
            .ledger
            .submit(
                &reg.credentials,
                &payment_module,
                functions::PROCESS_PAYMENT,
                key.ledger_args(),
            )
            .await;

        // 3. Classify
        match result {
            Ok(op) => {
                self.registry.mark_processed(key, Utc::now());
                debug!(stream = %key, operation = %op, "Payment claimed");
                StreamResult::Claimed
            }
            Err(e) if e.kind.is_definitive_gone() => {
                self.prune(reg, e.kind.code());
                StreamResult::Pruned
            }
            Err(e) if e.kind == LedgerErrorKind::InsufficientResources => {
                warn!(stream = %key, error = %e, "Payer cannot cover claim, keeping stream");
                StreamResult::Retained(e.kind)
            }
            Err(e) => {
                warn!(stream = %key, error = %e, "Payment claim failed, keeping stream");
                StreamResult::Retained(e.kind)
            }
        }
    }

    /// Drop `reg` unless the key was re-registered after the snapshot
    fn prune(&self, reg: &ActiveStreamRegistration, reason: &str) {
        if self.registry.unregister_if_same(&reg.key, reg.registered_at) {
            info!(stream = %reg.key, reason, "Stream pruned");
        } else if self.registry.contains(&reg.key) {
            debug!(stream = %reg.key, reason, "Stream re-registered during tick, keeping it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Address, MockLedgerClient};

    fn key(payer: &str, job_id: u64) -> StreamKey {
        StreamKey::parse(payer, job_id).unwrap()
    }

    fn setup(config: OrchestratorConfig) -> (Arc<MockLedgerClient>, PaymentOrchestrator) {
        let ledger = Arc::new(MockLedgerClient::new());
        let orchestrator =
            PaymentOrchestrator::new(ledger.clone(), ledger.modules().clone(), config);
        (ledger, orchestrator)
    }

    fn register(orch: &PaymentOrchestrator, key: &StreamKey) {
        orch.register_stream(
            key.clone(),
            Address::parse("0xbee").unwrap(),
            100,
            Credentials::generate(key.payer.clone()),
        );
    }

    fn completed(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Completed(report) => report,
            TickOutcome::Skipped => panic!("tick unexpectedly skipped"),
        }
    }

    #[tokio::test]
    async fn test_active_stream_is_claimed() {
        let (ledger, orch) = setup(OrchestratorConfig::default());
        let k = key("0xa", 1);
        ledger.set_stream(&k.payer, 1, true, false);
        register(&orch, &k);

        let report = completed(orch.tick().await);
        assert_eq!(report.claimed, 1);
        assert_eq!(ledger.submits_for(&k.payer, 1), 1);
        assert!(orch.registry().get(&k).unwrap().last_processed_at.is_some());
    }

    #[tokio::test]
    async fn test_inactive_stream_pruned_without_claim() {
        let (ledger, orch) = setup(OrchestratorConfig::default());
        let k = key("0xa", 1);
        ledger.set_stream(&k.payer, 1, false, false);
        register(&orch, &k);

        let report = completed(orch.tick().await);
        assert_eq!(report.pruned, 1);
        assert_eq!(ledger.submit_count(), 0);
        assert!(orch.registry().is_empty());

        let report = completed(orch.tick().await);
        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn test_missing_stream_pruned() {
        let (ledger, orch) = setup(OrchestratorConfig::default());
        let k = key("0xa", 1);
        register(&orch, &k);

        let report = completed(orch.tick().await);
        assert_eq!(report.pruned, 1);
        assert_eq!(ledger.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_paused_stream_kept_without_claim() {
        let (ledger, orch) = setup(OrchestratorConfig::default());
        let k = key("0xa", 1);
        ledger.set_stream(&k.payer, 1, false, true);
        register(&orch, &k);

        let report = completed(orch.tick().await);
        assert_eq!(report.paused, 1);
        assert_eq!(ledger.submit_count(), 0);
        assert!(orch.registry().contains(&k));

        // Resumed on the ledger: claimed again
        ledger.set_stream(&k.payer, 1, true, false);
        let report = completed(orch.tick().await);
        assert_eq!(report.claimed, 1);
        assert!(orch.registry().contains(&k));
    }

    #[tokio::test]
    async fn test_prune_spares_stream_registered_after_snapshot() {
        let (ledger, orch) = setup(OrchestratorConfig::default());
        let k = key("0xa", 1);
        register(&orch, &k);
        let stale = orch.registry().get(&k).unwrap();

        // Registration replaced while the old one was still being processed
        let mut fresh = stale.clone();
        fresh.registered_at = stale.registered_at + chrono::Duration::seconds(1);
        orch.registry().register(fresh);

        orch.prune(&stale, "stream closed on ledger");
        assert!(orch.registry().contains(&k));

        let current = orch.registry().get(&k).unwrap();
        orch.prune(&current, "stream closed on ledger");
        assert!(!orch.registry().contains(&k));
        assert_eq!(ledger.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_claim_closed_prunes() {
        let (ledger, orch) = setup(OrchestratorConfig::default());
        let k = key("0xa", 1);
        ledger.set_stream(&k.payer, 1, true, false);
        ledger.set_claim_failure(&k.payer, 1, Some(LedgerErrorKind::Closed));
        register(&orch, &k);

        let report = completed(orch.tick().await);
        assert_eq!(report.pruned, 1);
        assert!(!orch.registry().contains(&k));
    }

    #[tokio::test]
    async fn test_insufficient_funds_and_transient_keep_stream() {
        let (ledger, orch) = setup(OrchestratorConfig::default());
        let poor = key("0xa", 1);
        let flaky = key("0xb", 2);
        ledger.set_stream(&poor.payer, 1, true, false);
        ledger.set_stream(&flaky.payer, 2, true, false);
        ledger.set_claim_failure(&poor.payer, 1, Some(LedgerErrorKind::InsufficientResources));
        ledger.set_view_failure(&flaky.payer, 2, Some(LedgerErrorKind::Transient));
        register(&orch, &poor);
        register(&orch, &flaky);

        let report = completed(orch.tick().await);
        assert_eq!(report.retained_with_error, 2);
        assert_eq!(orch.registry().len(), 2);
        // Transient view failure means no claim attempt
        assert_eq!(ledger.submits_for(&flaky.payer, 2), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_batch_siblings() {
        let (ledger, orch) = setup(OrchestratorConfig {
            batch_size: 2,
            ..Default::default()
        });
        let keys: Vec<_> = (1..=5).map(|j| key("0xa", j)).collect();
        for k in &keys {
            ledger.set_stream(&k.payer, k.job_id, true, false);
            register(&orch, k);
        }
        ledger.set_claim_failure(&keys[0].payer, 1, Some(LedgerErrorKind::Rejected));

        let report = completed(orch.tick().await);
        assert_eq!(report.claimed, 4);
        assert_eq!(report.retained_with_error, 1);
        for k in &keys {
            assert_eq!(ledger.submits_for(&k.payer, k.job_id), 1);
        }
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let (ledger, orch) = setup(OrchestratorConfig::default());
        let orch = Arc::new(orch);
        let k = key("0xa", 1);
        ledger.set_stream(&k.payer, 1, true, false);
        register(&orch, &k);

        ledger.hold_submits();
        let running = tokio::spawn({
            let orch = orch.clone();
            async move { orch.tick().await }
        });
        while ledger.submit_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(orch.is_busy());

        assert_eq!(orch.tick().await, TickOutcome::Skipped);
        assert_eq!(ledger.submit_count(), 1);

        ledger.release_submits();
        let report = completed(running.await.unwrap());
        assert_eq!(report.claimed, 1);
        assert!(!orch.is_busy());
    }

    #[tokio::test]
    async fn test_min_claim_interval_skips_recent_claims() {
        let (ledger, orch) = setup(OrchestratorConfig {
            batch_size: 5,
            min_claim_interval: Duration::from_secs(3600),
        });
        let k = key("0xa", 1);
        ledger.set_stream(&k.payer, 1, true, false);
        register(&orch, &k);

        assert_eq!(completed(orch.tick().await).claimed, 1);
        assert_eq!(completed(orch.tick().await).not_due, 1);
        assert_eq!(ledger.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_status_lists_keys() {
        let (_ledger, orch) = setup(OrchestratorConfig::default());
        register(&orch, &key("0xb", 1));
        register(&orch, &key("0xa", 1));

        let status = orch.status();
        assert!(!status.running);
        assert_eq!(status.active_stream_count, 2);
        assert_eq!(status.active_stream_keys[0], key("0xa", 1));
    }
}
