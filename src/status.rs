//! Queue-depth aggregation: a 300 ms loop that renders per-peer backlog and
//! feeds the backpressure police of every peer client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::info;

use crate::outlog::OutLog;

pub const STATUS_INTERVAL: Duration = Duration::from_millis(300);

/// Backpressure hook for one peer. The peer client installs its current
/// error channel for the duration of a connection; the status loop reports
/// the queue depth here, and exceeding the configured limit feeds an error
/// into the channel, forcing the peer through its reconnect path.
pub struct QueuePolice {
    limit: u64,
    slot: Mutex<Option<mpsc::Sender<anyhow::Error>>>,
}

impl QueuePolice {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            slot: Mutex::new(None),
        }
    }

    pub fn install(&self, tx: mpsc::Sender<anyhow::Error>) {
        *self.slot.lock().unwrap() = Some(tx);
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap() = None;
    }

    pub fn check(&self, depth: u64) {
        if self.limit == 0 || depth <= self.limit {
            return;
        }
        if let Some(tx) = &*self.slot.lock().unwrap() {
            // non-blocking: if an error is already pending, teardown is
            // underway and another one adds nothing
            let _ = tx.try_send(anyhow!(
                "send queue size {} exceeds limit {}",
                depth,
                self.limit
            ));
        }
    }
}

/// Render per-peer queue depths and police the limits every 300 ms.
/// Peers still draining a rotated-away generation get a `*` suffix.
pub async fn status_loop(log: Arc<OutLog>, police: HashMap<String, Arc<QueuePolice>>) {
    let mut all_sent_logged = false;
    loop {
        tokio::time::sleep(STATUS_INTERVAL).await;

        let mut statuses = Vec::new();
        for peer in log.queue_depths() {
            if let Some(p) = police.get(&peer.peer) {
                p.check(peer.depth);
            }
            if peer.depth > 0 || peer.draining_old {
                statuses.push(format!(
                    "{} {}{}",
                    peer.peer,
                    format_length(peer.depth),
                    if peer.draining_old { "*" } else { "" }
                ));
            }
        }
        statuses.sort_by(|a, b| b.cmp(a));

        if !statuses.is_empty() {
            info!("pending diffs: {}", statuses.join("; "));
            all_sent_logged = false;
        } else if !all_sent_logged {
            info!("all diffs were sent");
            all_sent_logged = true;
        }
    }
}

pub fn format_length(len: u64) -> String {
    if len < 1024 {
        format!("{} B", len)
    } else if len < 1048576 {
        format!("{} KiB", len / 1024)
    } else {
        format!("{} MiB", len / 1048576)
    }
}
