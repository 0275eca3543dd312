//! Sync Service
//!
//! Owns the orchestrator and the indexer and drives both from their tick
//! sources. One instance per process in production; tests build as many
//! isolated instances as they like.
//!
//! ```text
//! payment ticks ──▶ spawn PaymentOrchestrator::tick      (fast)
//! indexer ticks ──▶ spawn LedgerSyncIndexer::incremental_sync (slow)
//! start()       ──▶ spawn LedgerSyncIndexer::full_sync   (once)
//! ```
//!
//! Tick bodies run as their own tasks so a slow body never delays the
//! ticker; the single-flight guards turn overlapping ticks into no-ops.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ConfigError};
use crate::core_types::{Amount, StreamKey};
use crate::indexer::{IndexerStatus, LedgerSyncIndexer};
use crate::ledger::{Address, Credentials, LedgerClient, LedgerError};
use crate::payments::{OrchestratorConfig, OrchestratorStatus, PaymentOrchestrator};
use crate::scheduler::{IntervalTicker, TickSource, TickSourceFactory};
use crate::store::{CursorStore, MirrorStore, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Ledger unreachable: {0}")]
    LedgerUnreachable(#[source] LedgerError),

    #[error("Mirror store unreachable: {0}")]
    StoreUnreachable(#[source] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::LedgerUnreachable(_) => "LEDGER_UNREACHABLE",
            ServiceError::StoreUnreachable(_) => "STORE_UNREACHABLE",
            ServiceError::Config(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub payments: OrchestratorStatus,
    pub indexer: IndexerStatus,
}

struct Timers {
    payments: JoinHandle<()>,
    indexer: JoinHandle<()>,
}

pub struct SyncService {
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn MirrorStore>,
    orchestrator: Arc<PaymentOrchestrator>,
    indexer: Arc<LedgerSyncIndexer>,
    payment_ticks: TickSourceFactory,
    indexer_ticks: TickSourceFactory,
    timers: Mutex<Option<Timers>>,
    /// Serializes concurrent `start` calls across the reachability checks
    start_lock: tokio::sync::Mutex<()>,
}

impl SyncService {
    /// Wire both components with wall-clock tickers from `config`
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn MirrorStore>,
        cursor: Arc<dyn CursorStore>,
        config: &AppConfig,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let modules = config.ledger.modules.clone();

        let orchestrator = Arc::new(PaymentOrchestrator::new(
            ledger.clone(),
            modules.clone(),
            OrchestratorConfig::from(&config.payments),
        ));
        let indexer = Arc::new(LedgerSyncIndexer::new(
            ledger.clone(),
            store.clone(),
            cursor,
            modules,
            config.tracked_account()?,
            &config.indexer,
        ));

        Ok(Self {
            ledger,
            store,
            orchestrator,
            indexer,
            payment_ticks: IntervalTicker::factory(config.payments.tick_interval(), false),
            indexer_ticks: IntervalTicker::factory(config.indexer.tick_interval(), true),
            timers: Mutex::new(None),
            start_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Replace the tick sources, e.g. with manual tickers in tests
    pub fn with_tick_sources(
        mut self,
        payment_ticks: TickSourceFactory,
        indexer_ticks: TickSourceFactory,
    ) -> Self {
        self.payment_ticks = payment_ticks;
        self.indexer_ticks = indexer_ticks;
        self
    }

    pub fn orchestrator(&self) -> &Arc<PaymentOrchestrator> {
        &self.orchestrator
    }

    pub fn indexer(&self) -> &Arc<LedgerSyncIndexer> {
        &self.indexer
    }

    pub fn register_stream(
        &self,
        key: StreamKey,
        payee: Address,
        rate_per_second: Amount,
        credentials: Credentials,
    ) -> bool {
        self.orchestrator
            .register_stream(key, payee, rate_per_second, credentials)
    }

    pub fn unregister_stream(&self, key: &StreamKey) -> bool {
        self.orchestrator.unregister_stream(key)
    }

    pub fn is_running(&self) -> bool {
        self.timers.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Verify collaborators, run the initial full sync and start both timers.
    ///
    /// Idempotent: a second call while running does nothing.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let _starting = self.start_lock.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let head = self
            .ledger
            .head_version()
            .await
            .map_err(ServiceError::LedgerUnreachable)?;
        self.store
            .health_check()
            .await
            .map_err(ServiceError::StoreUnreachable)?;

        info!(
            ledger = self.ledger.name(),
            head,
            account = %self.indexer.account(),
            "Collaborators reachable, starting sync service"
        );

        // Initial full sync runs detached; the first incremental tick skips
        // while it is still in flight.
        let indexer = self.indexer.clone();
        tokio::spawn(async move {
            if let Err(e) = indexer.full_sync().await {
                error!(code = e.code(), error = %e, "Initial full sync failed");
            }
        });

        let timers = Timers {
            payments: tokio::spawn(run_payment_timer(
                self.orchestrator.clone(),
                (self.payment_ticks)(),
            )),
            indexer: tokio::spawn(run_indexer_timer(
                self.indexer.clone(),
                (self.indexer_ticks)(),
            )),
        };

        self.orchestrator.set_running(true);
        self.indexer.set_running(true);
        if let Ok(mut slot) = self.timers.lock() {
            *slot = Some(timers);
        }
        Ok(())
    }

    /// Stop both timers. In-flight tick bodies and ledger calls run to completion.
    pub fn stop(&self) {
        let timers = match self.timers.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(timers) = timers else {
            return;
        };

        timers.payments.abort();
        timers.indexer.abort();
        self.orchestrator.set_running(false);
        self.indexer.set_running(false);
        info!("Sync service stopped");
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            payments: self.orchestrator.status(),
            indexer: self.indexer.status(),
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_payment_timer(
    orchestrator: Arc<PaymentOrchestrator>,
    mut source: Box<dyn TickSource>,
) {
    while source.next_tick().await {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.tick().await;
        });
    }
    warn!("Payment tick source exhausted");
}

async fn run_indexer_timer(indexer: Arc<LedgerSyncIndexer>, mut source: Box<dyn TickSource>) {
    while source.next_tick().await {
        let indexer = indexer.clone();
        tokio::spawn(async move {
            if let Err(e) = indexer.incremental_sync().await {
                warn!(code = e.code(), error = %e, "Incremental sync failed");
            }
        });
    }
    warn!("Indexer tick source exhausted");
}
