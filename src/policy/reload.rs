use super::PolicyGate;
use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Debounce so editors that write-then-rename trigger one reload.
const SETTLE: Duration = Duration::from_millis(200);

/// Watches the directory containing the gate's rule module and reloads on
/// every change. A reload that fails to compile logs a warning and leaves
/// the previous ruleset in force.
pub fn spawn_watcher(gate: Arc<PolicyGate>, cancel: CancellationToken) -> Result<()> {
    let Some(path) = gate.path().map(std::path::Path::to_path_buf) else {
        return Ok(());
    };
    let dir = path
        .parent()
        .context("policy file has no parent directory")?
        .to_path_buf();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if event.is_ok() {
                let _ = tx.send(());
            }
        })
        .context("creating policy watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching policy directory {}", dir.display()))?;
    info!(directory = %dir.display(), "Policy hot-reload watcher started");

    tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task.
        let _watcher = watcher;
        loop {
            tokio::select! {
                received = rx.recv() => {
                    if received.is_none() {
                        return;
                    }
                    // Collapse bursts of filesystem events.
                    tokio::time::sleep(SETTLE).await;
                    while rx.try_recv().is_ok() {}

                    match gate.reload() {
                        Ok(()) => info!(path = %path.display(), "Policy reloaded"),
                        Err(e) => warn!(
                            path = %path.display(),
                            error = %e,
                            "Policy reload failed, previous rules remain in force"
                        ),
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Policy watcher stopped");
                    return;
                }
            }
        }
    });

    Ok(())
}
