//! Metrics Runtime - one collection run per invocation
//!
//! Loads accounts from the sheet store, refreshes every post whose cached
//! metrics expired, and writes the rows back. Meant to be started on a
//! schedule; overlapping runs are refused through a lock file next to the
//! state file.
//!
//! Usage:
//!   cargo run --release --bin metrics_runtime
//!
//! Environment variables: see `threadflow::config::RuntimeConfig::from_env`.
//! `RUST_LOG` controls log filtering (default: info).
//!
//! Exit codes: 0 on a completed run (or when another run holds the lock),
//! 1 on an aborted run.

use chrono::Utc;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use threadflow::config::RuntimeConfig;
use threadflow::pipeline::{
    LogEventSink, Pipeline, RunLock, SqliteSheetStore, StateStore, ThreadsClient,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = RuntimeConfig::from_env()?;

    info!("🚀 Metrics Runtime");
    info!("   ├─ API: {}", config.api_base_url);
    info!("   ├─ State file: {}", config.state_file.display());
    info!("   ├─ Sheet store: {}", config.sheet_db_path.display());
    info!("   ├─ Tabs: {} -> {}", config.accounts_tab, config.metrics_tab);
    info!("   └─ TTL: {} min", config.metrics_ttl.as_secs() / 60);

    let Some(lock) = RunLock::try_acquire(&config.state_file, config.run_timeout, Utc::now())? else {
        warn!("⚠️  Another run holds {}, exiting", RunLock::path_for(&config.state_file).display());
        return Ok(());
    };

    let store = Arc::new(StateStore::open(&config.state_file)?);
    let sheets = Arc::new(SqliteSheetStore::open(
        &config.sheet_db_path,
        &config.accounts_tab,
        &config.metrics_tab,
    )?);
    let api = Arc::new(ThreadsClient::new(&config.api_base_url, config.request_timeout)?);

    let pipeline = Pipeline::new(
        config,
        api,
        sheets.clone(),
        sheets,
        store,
        Arc::new(LogEventSink),
    )?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("⚠️  Received CTRL+C, finishing in-flight requests...");
                stop_signal.store(true, Ordering::SeqCst);
            }
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        }
    });

    let summary = pipeline.run(stop).await;
    info!("📊 {}", serde_json::to_string(&summary)?);

    drop(lock);

    if !summary.is_success() {
        error!("❌ Run aborted");
        std::process::exit(1);
    }
    Ok(())
}
