// ABOUTME: Sink contract receiving captured change batches
// ABOUTME: Includes a JSON-lines sink used by the command-line runner

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// One unit of change data handed to the sink in a single call.
pub type ChangeBatch = Vec<Value>;

/// External consumer of captured batches.
///
/// Returning an error keeps the checkpoint where it was, so the same batch is
/// delivered again by the next invocation.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, batch: &[Value]) -> Result<()>;
}

/// Writes every record of a batch as one JSON document per line.
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonLinesSink {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Append to `path`, creating it if needed.
    pub async fn append_to(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open output file {:?}", path))?;
        Ok(Self::new(file))
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn deliver(&self, batch: &[Value]) -> Result<()> {
        let mut buf = Vec::new();
        for record in batch {
            serde_json::to_writer(&mut buf, record).context("Failed to serialize record")?;
            buf.push(b'\n');
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&buf)
            .await
            .context("Failed to write batch")?;
        // Flush per batch so a checkpoint never runs ahead of buffered output
        writer.flush().await.context("Failed to flush batch")?;
        Ok(())
    }
}
