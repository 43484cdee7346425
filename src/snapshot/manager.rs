use crate::snapshot::WorldSnapshot;
use crate::store::WorldStore;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Flushes the durable entity subset to a single snapshot file on a fixed
/// cadence and once more on shutdown.
pub struct SnapshotManager {
    store: Arc<WorldStore>,
    node_id: String,
    path: PathBuf,
    flush_interval: Duration,
}

impl SnapshotManager {
    pub fn new(
        store: Arc<WorldStore>,
        node_id: &str,
        path: PathBuf,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            path,
            flush_interval,
        }
    }

    /// Serializes the durable subset and atomically replaces the file.
    pub fn flush(&self) -> Result<()> {
        let snapshot = WorldSnapshot::from_store(&self.store, &self.node_id);
        let entity_count = snapshot.entity_count();
        snapshot.save_to_file(&self.path)?;
        info!(
            entities = entity_count,
            path = %self.path.display(),
            "Snapshot flushed"
        );
        Ok(())
    }

    /// Runs until cancelled, flushing on the configured cadence; a final
    /// flush runs on the way out so graceful shutdown never loses state.
    pub async fn run_flush_loop(&self, cancel: CancellationToken) {
        info!(
            interval_secs = self.flush_interval.as_secs(),
            path = %self.path.display(),
            "Starting snapshot manager"
        );

        let mut timer = interval(self.flush_interval);
        // The immediate first tick would rewrite what we just loaded.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = self.flush() {
                        error!(error = %e, "Failed to flush snapshot");
                    }
                }
                _ = cancel.cancelled() => {
                    if let Err(e) = self.flush() {
                        error!(error = %e, "Failed to flush snapshot on shutdown");
                    }
                    return;
                }
            }
        }
    }
}
