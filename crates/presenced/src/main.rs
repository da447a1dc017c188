use anyhow::{Context, Result};
use presence_core::{DedupCoordinator, EmbeddingStore};
use presence_io::{Config, SqliteLedger};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod engine;
mod spool;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load()?;
    tracing::info!(
        corpus = %config.corpus_dir.display(),
        db = %config.db_path.display(),
        metric = %config.metric,
        tolerance = config.tolerance,
        window_secs = config.window_secs,
        source = ?config.snapshot_source,
        "configuration"
    );

    let ledger = SqliteLedger::open(&config.db_path)
        .with_context(|| format!("opening ledger at {}", config.db_path.display()))?;

    let mut store = EmbeddingStore::new(config.corpus(), config.encoder()?).with_cache(config.cache());
    if let Some(remote) = config.remote_store() {
        store = store.with_remote(remote);
    }

    let recognizer = engine::Recognizer::new(
        store,
        config.matcher_config(),
        DedupCoordinator::new(ledger, config.dedup_config()),
        config.snapshot_source,
    );
    let handle = engine::spawn_engine(recognizer)?;

    let watcher = spool::SpoolWatcher::new(
        &config.spool_dir,
        Duration::from_millis(config.poll_ms),
        Duration::from_secs(config.refresh_secs),
    );

    tracing::info!("presenced ready");

    tokio::select! {
        result = watcher.run(handle) => {
            result.context("frame spool stopped")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("presenced shutting down");
        }
    }

    Ok(())
}
