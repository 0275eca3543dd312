//! gpu_market_sync - payment scheduler and ledger sync daemon
//!
//! ```text
//! config/{env}.yaml ──▶ logging ──▶ LedgerClient ─┐
//!                                   MirrorStore ──┼──▶ SyncService ──▶ ctrl-c ──▶ stop
//!                                   CursorStore ──┘
//! ```
//!
//! Flags:
//! - `--env`, `-e <name>`: config file to load (default `dev`)
//! - `--memory-store`: ignore `database.url` and keep the mirror in memory
//! - `--mock-ledger`: use the scripted in-process ledger (dry run)

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use gpu_market_sync::config::AppConfig;
use gpu_market_sync::ledger::{LedgerClient, RpcLedgerClient};
use gpu_market_sync::logging::init_logging;
use gpu_market_sync::service::SyncService;
use gpu_market_sync::store::{CursorStore, MemoryStore, MirrorStore, PgMirrorStore};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|a| a == flag)
}

#[cfg(feature = "mock-ledger")]
fn mock_ledger(config: &AppConfig) -> Option<Arc<dyn LedgerClient>> {
    use gpu_market_sync::ledger::MockLedgerClient;

    has_flag("--mock-ledger").then(|| {
        Arc::new(MockLedgerClient::with_modules(config.ledger.modules.clone()))
            as Arc<dyn LedgerClient>
    })
}

#[cfg(not(feature = "mock-ledger"))]
fn mock_ledger(_config: &AppConfig) -> Option<Arc<dyn LedgerClient>> {
    None
}

fn build_ledger(config: &AppConfig) -> Result<Arc<dyn LedgerClient>> {
    if let Some(mock) = mock_ledger(config) {
        info!("Using scripted in-process ledger");
        return Ok(mock);
    }

    let client = RpcLedgerClient::new(&config.ledger).context("Failed to build ledger client")?;
    Ok(Arc::new(client))
}

async fn build_store(config: &AppConfig) -> Result<(Arc<dyn MirrorStore>, Arc<dyn CursorStore>)> {
    match &config.database.url {
        Some(url) if !has_flag("--memory-store") => {
            let store = PgMirrorStore::connect(url, config.database.max_connections)
                .await
                .context("Failed to connect to PostgreSQL")?;
            if config.database.init_schema {
                store.init_schema().await.context("Failed to initialize schema")?;
            }
            let store = Arc::new(store);
            Ok((store.clone(), store))
        }
        _ => {
            info!("Using in-memory mirror store");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("Failed to load config '{}'", env))?;
    let _guard = init_logging(&config);

    info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting gpu_market_sync"
    );

    let ledger = build_ledger(&config)?;
    let (store, cursor) = build_store(&config).await?;

    let service = SyncService::new(ledger, store, cursor, &config)?;
    service.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    service.stop();

    Ok(())
}
