//! Filesystem watcher interface.
//!
//! A recursive `notify` watcher forwards every event path into an unbounded
//! channel; normalisation to the containing directory and the 400 ms
//! coalescing both live in the aggregator, so the raw watcher stays dumb.
//! Readiness is signalled by the successful return of [`spawn`] — the watch
//! registration is synchronous.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// Start watching `root` recursively. Returned watcher must be kept alive for
/// the watch to stay registered.
pub fn spawn(root: &Path, tx: UnboundedSender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in event.paths {
                    // receiver gone means shutdown; nothing to do
                    let _ = tx.send(path);
                }
            }
            Err(e) => warn!("watcher error: {}", e),
        })
        .context("cannot create filesystem watcher")?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("cannot watch {}", root.display()))?;
    info!("watcher ready on {}", root.display());
    Ok(watcher)
}
