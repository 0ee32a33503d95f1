//! Coalescing buffer for deferred `used_quota` increments.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::channels::add_used_quota;

/// Pending per-channel quota deltas, merged additively until flushed.
pub struct QuotaBuffer {
    pool: SqlitePool,
    pending: DashMap<i64, i64>,
    size_threshold: usize,
    wake: Notify,
}

impl QuotaBuffer {
    pub fn new(pool: SqlitePool, size_threshold: usize) -> Self {
        Self {
            pool,
            pending: DashMap::new(),
            size_threshold: size_threshold.max(1),
            wake: Notify::new(),
        }
    }

    /// Queue `delta` for channel `id`. Deltas for the same channel coalesce.
    pub fn add(&self, id: i64, delta: i64) {
        *self.pending.entry(id).or_insert(0) += delta;
        if self.pending.len() >= self.size_threshold {
            self.wake.notify_one();
        }
    }

    /// Sum of pending deltas for a channel.
    pub fn pending_for(&self, id: i64) -> i64 {
        self.pending.get(&id).map(|v| *v).unwrap_or(0)
    }

    /// Write every pending delta. A delta whose write fails is put back so it
    /// is retried by the next flush. Returns the number of channels written.
    pub async fn flush(&self) -> usize {
        let ids: Vec<i64> = self.pending.iter().map(|e| *e.key()).collect();
        let mut written = 0;

        for id in ids {
            let Some((_, delta)) = self.pending.remove(&id) else {
                continue;
            };
            match add_used_quota(&self.pool, id, delta).await {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(channel_id = id, delta = delta, error = %e, "Failed to flush used quota");
                    *self.pending.entry(id).or_insert(0) += delta;
                }
            }
        }

        if written > 0 {
            tracing::debug!(channels = written, "Flushed used quota");
        }
        written
    }

    /// Flush on every `interval` tick or when the size threshold is hit,
    /// with a final flush on cancellation.
    pub fn spawn_flusher(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.wake.notified() => {}
                    _ = cancel.cancelled() => {
                        self.flush().await;
                        break;
                    }
                }
                self.flush().await;
            }
        })
    }
}
