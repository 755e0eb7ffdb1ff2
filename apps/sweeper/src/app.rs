//! Sweeper runtime: opens the store and runs the cleanup service.

use std::sync::Arc;

use landfall_store::{FileStore, SessionStore};
use landfall_transfer::{Cleaner, UploadSessionManager};

use crate::config::Config;

/// Runs the sweeper until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn SessionStore> = Arc::new(FileStore::open(&config.store_root).await?);
    tracing::info!(
        store = %config.store_root.display(),
        scratch = %config.upload.scratch_root.display(),
        ttl_secs = config.upload.session_ttl_secs,
        "session store opened"
    );

    let manager = UploadSessionManager::new(store, config.upload);
    let cleaner = Cleaner::new(manager);

    if config.sweep_on_start {
        match cleaner.sweep_once(chrono::Utc::now()).await {
            Ok(report) => tracing::info!(
                scanned = report.scanned,
                expired = report.expired,
                orphans_removed = report.orphans_removed,
                "startup sweep finished"
            ),
            Err(e) => tracing::warn!("startup sweep failed: {e}"),
        }
    }

    cleaner.start().await;

    // -- Main loop: wait for shutdown --
    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    // -- Graceful shutdown --
    cleaner.stop().await;

    Ok(())
}
