use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use super::schema::Database;
use crate::feed::SubscriptionKey;

// ============================================================================
// Write-behind
// ============================================================================

enum WriteOp {
    Save(String, i64),
    Flush(oneshot::Sender<()>),
}

/// Drain persistence requests in arrival order. Failures are logged; the
/// in-memory watermark already advanced and stays advanced.
async fn run_writer(db: Database, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(key, timestamp_ms) => {
                if let Err(e) = db.save_watermark(&key, timestamp_ms).await {
                    tracing::warn!(key = %key, timestamp_ms, error = %e, "Failed to persist watermark");
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Watermark writer stopped");
}

// ============================================================================
// Watermark Store
// ============================================================================

/// Latest delivered item time per subscription key.
///
/// Values only ever move forward. Each key is updated under its own shard
/// lock, so polls of unrelated subscriptions never serialize on each other.
/// No lock is held across an await point.
#[derive(Debug)]
pub struct WatermarkStore {
    marks: DashMap<SubscriptionKey, i64>,
    writer: Option<mpsc::UnboundedSender<WriteOp>>,
}

impl Default for WatermarkStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl WatermarkStore {
    /// A store that forgets everything on restart; every key bootstraps
    /// to "now" again on its next first poll.
    pub fn in_memory() -> Self {
        Self {
            marks: DashMap::new(),
            writer: None,
        }
    }

    /// Load persisted watermarks and write every advance back to `db`.
    ///
    /// Must be called inside a Tokio runtime; the writer runs as a
    /// background task until the store is dropped.
    pub async fn resume(db: Database) -> anyhow::Result<Self> {
        let rows = db.load_watermarks().await?;
        let marks = DashMap::with_capacity(rows.len());
        for (key, timestamp_ms) in rows {
            marks.insert(SubscriptionKey::from_raw(key), timestamp_ms);
        }
        tracing::info!(count = marks.len(), "Resumed persisted watermarks");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(db, rx));

        Ok(Self {
            marks,
            writer: Some(tx),
        })
    }

    /// Like [`resume`](Self::resume), but first drop persisted watermarks
    /// for keys no longer in `configured` so removed subscriptions do not
    /// linger in the database.
    pub async fn resume_configured(
        db: Database,
        configured: &[SubscriptionKey],
    ) -> anyhow::Result<Self> {
        let keep: Vec<String> = configured.iter().map(|k| k.as_str().to_string()).collect();
        let removed = db.prune_watermarks(&keep).await?;
        if removed > 0 {
            tracing::info!(removed, "Pruned watermarks of unconfigured subscriptions");
        }
        Self::resume(db).await
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<i64> {
        self.marks.get(key).map(|v| *v)
    }

    /// Return the watermark for `key`, setting it to `now_ms` first if the
    /// key has never been seen. Calling it again is a no-op.
    pub fn ensure_initialized(&self, key: &SubscriptionKey, now_ms: i64) -> i64 {
        let (value, created) = match self.marks.entry(key.clone()) {
            Entry::Occupied(existing) => (*existing.get(), false),
            Entry::Vacant(vacant) => {
                vacant.insert(now_ms);
                (now_ms, true)
            }
        };

        if created {
            tracing::info!(key = %key, watermark = now_ms, "Bootstrapped watermark to now");
            self.persist(key, now_ms);
        }
        value
    }

    /// Move the watermark for `key` to `candidate` if it is strictly newer.
    /// Returns whether the stored value changed.
    pub fn advance(&self, key: &SubscriptionKey, candidate: i64) -> bool {
        let advanced = match self.marks.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if candidate > *existing.get() {
                    existing.insert(candidate);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(candidate);
                true
            }
        };

        if advanced {
            tracing::debug!(key = %key, watermark = candidate, "Advanced watermark");
            self.persist(key, candidate);
        }
        advanced
    }

    /// Snapshot of all watermarks, sorted by key.
    pub fn snapshot(&self) -> Vec<(SubscriptionKey, i64)> {
        let mut all: Vec<_> = self
            .marks
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort();
        all
    }

    /// Wait until every write queued so far has reached the database.
    /// Returns immediately for in-memory stores.
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if writer.send(WriteOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn persist(&self, key: &SubscriptionKey, timestamp_ms: i64) {
        if let Some(writer) = &self.writer {
            if writer
                .send(WriteOp::Save(key.as_str().to_string(), timestamp_ms))
                .is_err()
            {
                tracing::warn!(key = %key, "Watermark writer is gone; value kept in memory only");
            }
        }
    }
}
