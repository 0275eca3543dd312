//! Ledger Sync Indexer
//!
//! Replays the tracked account's operation history into the mirror store.
//!
//! # Cursor protocol
//! - Pages are fetched from `cursor + 1`, ascending by version.
//! - Every event of a page is attempted before the cursor moves; per-event
//!   failures are logged and skipped.
//! - The cursor is persisted after each page, so a crash loses at most the
//!   page in flight. Handlers are idempotent, so that page is simply redone.
//! - The cursor only ever holds a version that was actually applied. It
//!   never moves backwards and never jumps ahead to the head version, so an
//!   operation that shows up late below the head is still picked up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::IndexerError;
use super::handlers::{ApplyOutcome, EventApplier};
use crate::config::IndexerConfig;
use crate::core_types::Version;
use crate::ledger::{Address, LedgerClient, LedgerModules, LedgerOperation};
use crate::scheduler::SingleFlight;
use crate::store::{CursorStore, MirrorStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another sync was still running
    Skipped,
    /// Ledger head is not ahead of the cursor
    UpToDate { cursor: Version },
    Synced(SyncReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub from_version: Version,
    pub to_version: Version,
    pub pages: usize,
    pub operations: usize,
    pub events_applied: usize,
    pub events_failed: usize,
    pub events_ignored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexerStatus {
    pub running: bool,
    pub sync_in_progress: bool,
    pub last_processed_version: Version,
    pub events_applied_total: u64,
    pub events_failed_total: u64,
}

pub struct LedgerSyncIndexer {
    ledger: Arc<dyn LedgerClient>,
    cursor: Arc<dyn CursorStore>,
    applier: EventApplier,
    account: Address,
    page_size: usize,
    flight: SingleFlight,
    running: AtomicBool,
    /// In-memory copy of the persisted cursor, for status
    last_version: AtomicU64,
    events_applied_total: AtomicU64,
    events_failed_total: AtomicU64,
}

impl LedgerSyncIndexer {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn MirrorStore>,
        cursor: Arc<dyn CursorStore>,
        modules: LedgerModules,
        account: Address,
        config: &IndexerConfig,
    ) -> Self {
        let applier = EventApplier::new(ledger.clone(), store, modules, config.refresh_from_views);
        Self {
            ledger,
            cursor,
            applier,
            account,
            page_size: config.page_size.max(1),
            flight: SingleFlight::new(),
            running: AtomicBool::new(false),
            last_version: AtomicU64::new(0),
            events_applied_total: AtomicU64::new(0),
            events_failed_total: AtomicU64::new(0),
        }
    }

    pub fn account(&self) -> &Address {
        &self.account
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_syncing(&self) -> bool {
        self.flight.is_busy()
    }

    pub fn status(&self) -> IndexerStatus {
        IndexerStatus {
            running: self.running.load(Ordering::SeqCst),
            sync_in_progress: self.flight.is_busy(),
            last_processed_version: self.last_version.load(Ordering::SeqCst),
            events_applied_total: self.events_applied_total.load(Ordering::SeqCst),
            events_failed_total: self.events_failed_total.load(Ordering::SeqCst),
        }
    }

    /// Replay everything after the persisted cursor up to the current head
    pub async fn full_sync(&self) -> Result<SyncOutcome, IndexerError> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Sync already in progress, skipping full sync");
            return Ok(SyncOutcome::Skipped);
        };

        let cursor = self.load_cursor().await?;
        let head = self.ledger.head_version().await?;
        info!(cursor, head, account = %self.account, "Starting full sync");

        let report = self.replay(cursor, head).await?;
        info!(
            from = report.from_version,
            to = report.to_version,
            pages = report.pages,
            operations = report.operations,
            events_applied = report.events_applied,
            events_failed = report.events_failed,
            "Full sync completed"
        );
        Ok(SyncOutcome::Synced(report))
    }

    /// Catch up to the current head; a no-op when already there
    pub async fn incremental_sync(&self) -> Result<SyncOutcome, IndexerError> {
        let Some(_guard) = self.flight.try_enter() else {
            debug!("Sync already in progress, skipping incremental sync");
            return Ok(SyncOutcome::Skipped);
        };

        let head = self.ledger.head_version().await?;
        let cursor = self.load_cursor().await?;
        if head <= cursor {
            debug!(cursor, head, "Mirror up to date");
            return Ok(SyncOutcome::UpToDate { cursor });
        }

        let report = self.replay(cursor, head).await?;
        if report.operations > 0 {
            info!(
                from = report.from_version,
                to = report.to_version,
                operations = report.operations,
                events_applied = report.events_applied,
                events_failed = report.events_failed,
                "Incremental sync completed"
            );
        }
        Ok(SyncOutcome::Synced(report))
    }

    async fn load_cursor(&self) -> Result<Version, IndexerError> {
        let cursor = self.cursor.get().await?.unwrap_or(0);
        self.last_version.fetch_max(cursor, Ordering::SeqCst);
        Ok(cursor)
    }

    async fn persist_cursor(&self, version: Version) -> Result<(), IndexerError> {
        self.cursor.set(version).await?;
        self.last_version.fetch_max(version, Ordering::SeqCst);
        Ok(())
    }

    /// Page through `(cursor, target]`
    async fn replay(&self, start: Version, target: Version) -> Result<SyncReport, IndexerError> {
        let mut report = SyncReport {
            from_version: start,
            to_version: start,
            ..Default::default()
        };
        let mut cursor = start;

        loop {
            let page = self
                .ledger
                .history(&self.account, cursor + 1, self.page_size)
                .await?;
            report.pages += 1;

            let mut exhausted = page.len() < self.page_size;
            let mut page_max = cursor;

            for op in &page {
                if op.version > target {
                    exhausted = true;
                    break;
                }
                if op.version <= cursor {
                    continue;
                }
                self.apply_operation(op, &mut report).await;
                page_max = page_max.max(op.version);
            }

            if page_max > cursor {
                self.persist_cursor(page_max).await?;
                debug!(from = cursor, to = page_max, "Cursor advanced");
                cursor = page_max;
            } else if !exhausted {
                // Full page with nothing new; stop rather than refetch it forever
                warn!(from = cursor + 1, "History page made no progress, stopping");
                break;
            }

            if exhausted {
                break;
            }
        }
        report.to_version = cursor;

        Ok(report)
    }

    async fn apply_operation(&self, op: &LedgerOperation, report: &mut SyncReport) {
        report.operations += 1;

        for event in &op.events {
            match self.applier.apply(event, op.version).await {
                Ok(ApplyOutcome::Applied) | Ok(ApplyOutcome::NotMirrored) => {
                    report.events_applied += 1;
                    self.events_applied_total.fetch_add(1, Ordering::Relaxed);
                }
                Ok(ApplyOutcome::Ignored) => {
                    report.events_ignored += 1;
                    debug!(version = op.version, event = %event.event_type, "Untracked event type");
                }
                Err(e) => {
                    report.events_failed += 1;
                    self.events_failed_total.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        version = op.version,
                        event = %event.event_type,
                        code = e.code(),
                        error = %e,
                        "Failed to apply event, continuing"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerEvent, MockLedgerClient};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn account() -> Address {
        Address::parse("0xacc").unwrap()
    }

    fn op(version: u64) -> LedgerOperation {
        LedgerOperation {
            version,
            hash: format!("0x{:x}", version),
            events: vec![LedgerEvent::new(
                "0x1::job_registry::JobCreated",
                json!({
                    "job_id": version,
                    "buyer": "0xb0",
                    "provider": "0xa1",
                    "max_duration": 60,
                    "price_per_second": 1,
                    "created_at": 1,
                }),
            )],
        }
    }

    fn setup(page_size: usize) -> (Arc<MockLedgerClient>, Arc<MemoryStore>, LedgerSyncIndexer) {
        let ledger = Arc::new(MockLedgerClient::new());
        let store = Arc::new(MemoryStore::new());
        let config = IndexerConfig {
            page_size,
            refresh_from_views: false,
            ..Default::default()
        };
        let indexer = LedgerSyncIndexer::new(
            ledger.clone(),
            store.clone(),
            store.clone(),
            ledger.modules().clone(),
            account(),
            &config,
        );
        (ledger, store, indexer)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn synced(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Synced(report) => report,
            other => panic!("expected sync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_sync_pages_and_persists() {
        let (ledger, store, indexer) = setup(10);
        ledger.push_operations((1..=25).map(op));

        let report = synced(indexer.full_sync().await.unwrap());
        assert_eq!(report.pages, 3);
        assert_eq!(report.operations, 25);
        assert_eq!(report.events_applied, 25);
        assert_eq!(store.get().await.unwrap(), Some(25));
        assert_eq!(indexer.status().last_processed_version, 25);
        assert_eq!(ledger.history_calls(), vec![(1, 10), (11, 10), (21, 10)]);
    }

    #[tokio::test]
    async fn test_sparse_history_keeps_cursor_at_last_applied() {
        let (ledger, store, indexer) = setup(10);
        ledger.push_operations([op(3), op(9)]);
        ledger.set_head_version(Some(40));

        let report = synced(indexer.full_sync().await.unwrap());
        assert_eq!(report.operations, 2);
        assert_eq!(report.to_version, 9);
        assert_eq!(store.get().await.unwrap(), Some(9));

        // Nothing new yet: an empty page, cursor stays put
        let report = synced(indexer.incremental_sync().await.unwrap());
        assert_eq!(report.operations, 0);
        assert_eq!(store.get().await.unwrap(), Some(9));

        // An operation below the old head becomes visible late
        ledger.push_operations([op(20)]);
        let report = synced(indexer.incremental_sync().await.unwrap());
        assert_eq!(report.operations, 1);
        assert_eq!(store.get().await.unwrap(), Some(20));
        assert!(store.get_job(20).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_operations_past_head_wait_for_next_sync() {
        let (ledger, store, indexer) = setup(10);
        ledger.push_operations((1..=5).map(op));
        ledger.set_head_version(Some(3));

        let report = synced(indexer.full_sync().await.unwrap());
        assert_eq!(report.operations, 3);
        assert_eq!(store.get().await.unwrap(), Some(3));
        assert!(store.get_job(4).await.unwrap().is_none());

        ledger.set_head_version(None);
        let report = synced(indexer.incremental_sync().await.unwrap());
        assert_eq!(report.operations, 2);
        assert_eq!(store.get().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_incremental_noop_when_caught_up() {
        let (ledger, store, indexer) = setup(10);
        store.set(7).await.unwrap();
        ledger.set_head_version(Some(7));

        let outcome = indexer.incremental_sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::UpToDate { cursor: 7 });
        assert_eq!(ledger.history_count(), 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_history_failure_keeps_completed_pages() {
        let (ledger, store, indexer) = setup(10);
        ledger.push_operations((1..=30).map(op));
        ledger.fail_history_from(Some(11));

        let err = indexer.full_sync().await.unwrap_err();
        assert_eq!(err.code(), "TRANSIENT");
        assert_eq!(store.get().await.unwrap(), Some(10));
        assert!(!indexer.is_syncing());
    }

    #[tokio::test]
    async fn test_bad_event_does_not_stop_sync() {
        let (ledger, store, indexer) = setup(10);
        let mut broken = op(2);
        broken.events[0].data = json!({ "buyer": "0xb0" });
        ledger.push_operations([op(1), broken, op(3)]);

        let report = synced(indexer.full_sync().await.unwrap());
        assert_eq!(report.events_applied, 2);
        assert_eq!(report.events_failed, 1);
        assert_eq!(store.get().await.unwrap(), Some(3));
        assert_eq!(indexer.status().events_failed_total, 1);
    }

    #[tokio::test]
    async fn test_cursor_write_failure_is_reported() {
        let (ledger, store, indexer) = setup(10);
        ledger.push_operations((1..=3).map(op));
        store.set_fail_cursor_writes(true);

        let err = indexer.full_sync().await.unwrap_err();
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        assert_eq!(indexer.status().last_processed_version, 0);
        assert_eq!(store.get().await.unwrap(), None);
        let before_restart = store.snapshot().await;
        assert_eq!(before_restart.jobs.len(), 3);

        // Restart over the same store: the unpersisted page is applied again
        store.set_fail_cursor_writes(false);
        let restarted = LedgerSyncIndexer::new(
            ledger.clone(),
            store.clone(),
            store.clone(),
            ledger.modules().clone(),
            account(),
            &IndexerConfig {
                page_size: 10,
                refresh_from_views: false,
                ..Default::default()
            },
        );
        let report = synced(restarted.full_sync().await.unwrap());
        assert_eq!(report.from_version, 0);
        assert_eq!(report.operations, 3);
        assert_eq!(report.events_applied, 3);
        assert_eq!(store.get().await.unwrap(), Some(3));
        assert_eq!(store.snapshot().await, before_restart);
    }

    #[tokio::test]
    async fn test_overlapping_sync_is_skipped() {
        let (ledger, store, indexer) = setup(10);
        ledger.push_operations((1..=5).map(op));
        let indexer = Arc::new(indexer);

        // Full sync blocks inside its first history page
        ledger.hold_history();
        let running = tokio::spawn({
            let indexer = indexer.clone();
            async move { indexer.full_sync().await }
        });
        wait_until(|| ledger.history_count() == 1).await;
        assert!(indexer.status().sync_in_progress);

        let outcome = indexer.incremental_sync().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Skipped);
        assert_eq!(ledger.history_count(), 1);
        assert_eq!(store.write_count(), 0);
        assert!(indexer.status().sync_in_progress);

        ledger.release_history();
        let report = synced(running.await.unwrap().unwrap());
        assert_eq!(report.operations, 5);
        assert!(!indexer.status().sync_in_progress);
        assert_eq!(store.get().await.unwrap(), Some(5));
    }
}
