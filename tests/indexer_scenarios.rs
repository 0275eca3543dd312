//! Indexer replay scenarios: paging, restart and convergence

use std::sync::Arc;

use serde_json::{Value, json};

use gpu_market_sync::config::IndexerConfig;
use gpu_market_sync::indexer::{LedgerSyncIndexer, SyncOutcome, SyncReport};
use gpu_market_sync::ledger::{Address, LedgerEvent, LedgerOperation, MockLedgerClient};
use gpu_market_sync::store::{CursorStore, MemoryStore};
use gpu_market_sync::StreamKey;

fn account() -> Address {
    Address::parse("0xacc").unwrap()
}

fn indexer(
    ledger: &Arc<MockLedgerClient>,
    mirror: &Arc<MemoryStore>,
    cursor: &Arc<MemoryStore>,
    page_size: usize,
) -> LedgerSyncIndexer {
    let config = IndexerConfig {
        page_size,
        refresh_from_views: false,
        ..Default::default()
    };
    LedgerSyncIndexer::new(
        ledger.clone(),
        mirror.clone(),
        cursor.clone(),
        ledger.modules().clone(),
        account(),
        &config,
    )
}

fn event(name: &str, data: Value) -> LedgerEvent {
    let module = if name.starts_with("Job") {
        "job_registry"
    } else {
        "stream_payment"
    };
    LedgerEvent::new(format!("0x1::{}::{}", module, name), data)
}

fn op(version: u64, events: Vec<LedgerEvent>) -> LedgerOperation {
    LedgerOperation {
        version,
        hash: format!("0x{:x}", version),
        events,
    }
}

fn job_created(version: u64) -> LedgerOperation {
    op(
        version,
        vec![event(
            "JobCreated",
            json!({
                "job_id": version.to_string(),
                "buyer": "0xb0",
                "provider": "0xa1",
                "max_duration": "3600",
                "price_per_second": "10",
                "created_at": "1700000000",
            }),
        )],
    )
}

fn synced(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Synced(report) => report,
        other => panic!("expected sync, got {:?}", other),
    }
}

async fn cursor_of(store: &MemoryStore) -> Option<u64> {
    CursorStore::get(store).await.unwrap()
}

#[tokio::test]
async fn full_sync_walks_history_in_pages() {
    let ledger = Arc::new(MockLedgerClient::new());
    let store = Arc::new(MemoryStore::new());
    ledger.push_operations((1..=250).map(job_created));

    let report = synced(indexer(&ledger, &store, &store, 100).full_sync().await.unwrap());

    assert_eq!(ledger.history_calls(), vec![(1, 100), (101, 100), (201, 100)]);
    assert_eq!(report.to_version, 250);
    assert_eq!(report.events_applied, 250);
    assert_eq!(cursor_of(&store).await, Some(250));
    assert_eq!(store.snapshot().await.jobs.len(), 250);
}

#[tokio::test]
async fn caught_up_incremental_sync_touches_nothing() {
    let ledger = Arc::new(MockLedgerClient::new());
    let store = Arc::new(MemoryStore::new());
    ledger.push_operations((1..=5).map(job_created));
    let idx = indexer(&ledger, &store, &store, 100);
    idx.full_sync().await.unwrap();

    let history_before = ledger.history_count();
    let writes_before = store.write_count();

    let outcome = idx.incremental_sync().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::UpToDate { cursor: 5 }));
    assert_eq!(ledger.history_count(), history_before);
    assert_eq!(store.write_count(), writes_before);
}

#[tokio::test]
async fn restart_resumes_from_persisted_cursor() {
    let ledger = Arc::new(MockLedgerClient::new());
    let store = Arc::new(MemoryStore::new());
    ledger.push_operations((1..=250).map(job_created));
    ledger.fail_history_from(Some(101));

    let err = indexer(&ledger, &store, &store, 100)
        .full_sync()
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSIENT");
    assert_eq!(cursor_of(&store).await, Some(100));

    // Process restart: fresh indexer over the same store
    ledger.fail_history_from(None);
    let calls_before = ledger.history_calls().len();
    let report = synced(indexer(&ledger, &store, &store, 100).full_sync().await.unwrap());

    assert_eq!(report.from_version, 100);
    assert_eq!(ledger.history_calls()[calls_before], (101, 100));
    assert_eq!(cursor_of(&store).await, Some(250));
    assert_eq!(store.snapshot().await.jobs.len(), 250);
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let ledger = Arc::new(MockLedgerClient::new());
    let store = Arc::new(MemoryStore::new());
    ledger.push_operations((1..=30).map(job_created));
    indexer(&ledger, &store, &store, 10).full_sync().await.unwrap();

    // A lagging node reports an older head
    ledger.set_head_version(Some(12));
    let outcome = indexer(&ledger, &store, &store, 10)
        .incremental_sync()
        .await
        .unwrap();

    assert!(matches!(outcome, SyncOutcome::UpToDate { cursor: 30 }));
    assert_eq!(cursor_of(&store).await, Some(30));
}

fn stream_lifecycle() -> Vec<LedgerOperation> {
    let stream = json!({ "payer": "0xb0", "job_id": "7" });
    vec![
        job_created(7),
        op(
            8,
            vec![
                event("JobStarted", json!({ "job_id": "7" })),
                event(
                    "StreamCreated",
                    json!({
                        "payer": "0xb0",
                        "payee": "0xa1",
                        "job_id": "7",
                        "rate_per_second": "10",
                        "start_time": "1700000010",
                    }),
                ),
            ],
        ),
        op(
            9,
            vec![event(
                "PaymentProcessed",
                json!({
                    "payer": "0xb0",
                    "job_id": "7",
                    "total_accrued": "600",
                    "timestamp": "1700000070",
                }),
            )],
        ),
        op(10, vec![event("StreamPaused", stream.clone())]),
        op(11, vec![event("StreamResumed", stream)]),
        op(
            12,
            vec![
                event(
                    "StreamClosed",
                    json!({ "payer": "0xb0", "job_id": "7", "total_accrued": "900" }),
                ),
                event("JobCompleted", json!({ "job_id": "7" })),
            ],
        ),
    ]
}

#[tokio::test]
async fn replaying_history_converges_to_same_mirror() {
    let ledger = Arc::new(MockLedgerClient::new());
    let mirror = Arc::new(MemoryStore::new());
    ledger.push_operations(stream_lifecycle());

    let first_cursor = Arc::new(MemoryStore::new());
    indexer(&ledger, &mirror, &first_cursor, 2).full_sync().await.unwrap();
    let once = mirror.snapshot().await;

    // Lost cursor: the whole history is applied a second time
    let second_cursor = Arc::new(MemoryStore::new());
    indexer(&ledger, &mirror, &second_cursor, 2).full_sync().await.unwrap();
    let twice = mirror.snapshot().await;

    assert_eq!(once, twice);

    let key = StreamKey::parse("0xb0", 7).unwrap();
    let stream = &twice.streams[&key];
    assert!(stream.is_closed());
    assert!(!stream.is_paused);
    assert_eq!(stream.total_accrued, 900);
    assert_eq!(stream.last_processed_at, Some(1_700_000_070));
}
