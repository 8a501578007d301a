//! Delivery collaborators that receive merged batches.
//!
//! A sink's failure is reported by the scheduler and otherwise ignored: the
//! watermarks already advanced and the cache keeps what it fetched.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::feed::DeliveryBatch;

#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, batch: &DeliveryBatch) -> Result<()>;
}

/// Logs each delivered item through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn deliver(&self, batch: &DeliveryBatch) -> Result<()> {
        for item in &batch.items {
            let resolved = item.resources.iter().filter(|r| r.local.is_some()).count();
            tracing::info!(
                key = %item.source_key,
                timestamp_ms = item.timestamp_ms,
                resources = item.resources.len(),
                resolved,
                payload = %item.payload,
                "Delivered item"
            );
        }
        Ok(())
    }
}

/// Writes every item as one JSON object per line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> DeliverySink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn deliver(&self, batch: &DeliveryBatch) -> Result<()> {
        let mut buf = Vec::new();
        for item in &batch.items {
            serde_json::to_writer(&mut buf, item).context("Failed to encode item")?;
            buf.push(b'\n');
        }

        // One write per batch so concurrent timelines never interleave lines.
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&buf)
            .await
            .context("Failed to write delivery batch")?;
        writer.flush().await.context("Failed to flush delivery batch")?;
        Ok(())
    }
}
