use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::queue::{OfflineQueue, QueueEntry};
use crate::web::client::ApiClient;

/// Sends one queued entry to its backing endpoint.
#[async_trait]
pub trait Replayer: Send + Sync {
    async fn replay(&self, entry: &QueueEntry) -> Result<()>;
}

/// Replays against the sitelog server, carrying the entry's idempotency key
/// so a write that succeeded without acknowledgement is not duplicated.
pub struct HttpReplayer {
    client: ApiClient,
}

impl HttpReplayer {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Replayer for HttpReplayer {
    async fn replay(&self, entry: &QueueEntry) -> Result<()> {
        self.client
            .post_json(
                entry.entry_type.endpoint(),
                &entry.payload,
                Some(&entry.idempotency_key),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub success_count: usize,
    pub failed_count: usize,
}

pub struct SyncManager<R> {
    queue: OfflineQueue,
    replayer: R,
}

impl<R: Replayer> SyncManager<R> {
    pub fn new(queue: OfflineQueue, replayer: R) -> Self {
        Self { queue, replayer }
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Replay every unsynced entry once, sequentially, in enqueue order.
    /// A failed entry stays unsynced and does not stop the entries after it,
    /// including one the server accepted but the queue could not mark. Its
    /// next replay carries the same idempotency key.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let pending = self.queue.list_unsynced().await?;
        let mut report = SyncReport::default();
        if pending.is_empty() {
            debug!("offline queue is empty");
            return Ok(report);
        }
        info!("replaying {} queued entries", pending.len());

        for entry in &pending {
            match self.replayer.replay(entry).await {
                Ok(()) => match self.queue.mark_synced(&entry.id).await {
                    Ok(()) => report.success_count += 1,
                    Err(err) => {
                        warn!(
                            "{} entry {} was replayed but not marked synced: {err:#}",
                            entry.entry_type.as_str(),
                            entry.id
                        );
                        report.failed_count += 1;
                    }
                },
                Err(err) => {
                    warn!(
                        "replay of {} entry {} failed: {err:#}",
                        entry.entry_type.as_str(),
                        entry.id
                    );
                    report.failed_count += 1;
                }
            }
        }

        info!(
            "sync finished: {} synced, {} failed",
            report.success_count, report.failed_count
        );
        Ok(report)
    }
}

/// Remembers the last observed connectivity and reports offline→online
/// transitions. Starts offline, so the first online observation counts.
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
    online: bool,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Record an observation; true exactly when it is an offline→online edge.
    pub fn observe(&mut self, online: bool) -> bool {
        let regained = online && !self.online;
        if online != self.online {
            info!("connectivity: {}", if online { "online" } else { "offline" });
        }
        self.online = online;
        regained
    }
}

/// Check connectivity every `interval` and run one sync per regained
/// connection. Runs until the future is dropped.
pub async fn watch<R: Replayer>(manager: &SyncManager<R>, client: &ApiClient, interval: Duration) {
    let mut monitor = ConnectivityMonitor::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if monitor.observe(client.is_online().await) {
            if let Err(err) = manager.sync_all().await {
                warn!("sync after reconnect failed: {err:#}");
            }
        }
    }
}
