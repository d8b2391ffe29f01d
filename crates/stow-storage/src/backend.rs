//! StorageHandler over an OpenDAL operator

use anyhow::{Context, Result};
use async_trait::async_trait;
use opendal::{Operator, Writer};
use stow_core::{StowError, StowResult};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::{Payload, StorageHandler};

/// Read buffer for streaming payloads into the writer
const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Clone)]
pub struct OpendalHandler {
    op: Operator,
}

impl OpendalHandler {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

#[async_trait]
impl StorageHandler for OpendalHandler {
    async fn put(
        &self,
        cancel: &CancellationToken,
        mut content: Payload,
        dst: &str,
        size: u64,
    ) -> StowResult<()> {
        if cancel.is_cancelled() {
            return Err(StowError::Cancelled);
        }

        let mut writer = self
            .op
            .writer(dst)
            .await
            .map_err(|e| write_error(dst, e.into()))?;

        let copied = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StowError::Cancelled),
            res = copy_exact(&mut writer, &mut content, size) => res.map_err(|e| write_error(dst, e)),
        };

        if let Err(e) = copied {
            // Abort discards everything written so far
            if let Err(abort_err) = writer.abort().await {
                warn!(path = %dst, "aborting partial write failed: {abort_err}");
            }
            return Err(e);
        }

        writer
            .close()
            .await
            .map(|_| ())
            .map_err(|e| write_error(dst, e.into()))?;

        debug!(path = %dst, bytes = size, "stored");
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, paths: &[String]) -> StowResult<Vec<String>> {
        let mut deleted = Vec::with_capacity(paths.len());
        let mut failed = Vec::new();
        let mut reasons = Vec::new();

        for path in paths {
            if cancel.is_cancelled() {
                failed.push(path.clone());
                continue;
            }
            match self.op.delete(path).await {
                Ok(()) => deleted.push(path.clone()),
                Err(e) => {
                    warn!(path = %path, "delete failed: {e}");
                    reasons.push(format!("{path}: {e}"));
                    failed.push(path.clone());
                }
            }
        }

        if failed.is_empty() {
            return Ok(deleted);
        }
        if cancel.is_cancelled() {
            reasons.push("cancelled".into());
        }
        Err(StowError::BackendDelete {
            deleted,
            failed,
            reason: reasons.join("; "),
        })
    }
}

/// Stream exactly `size` bytes from `content` into `writer`.
async fn copy_exact(writer: &mut Writer, content: &mut Payload, size: u64) -> Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = content.read(&mut buf).await.context("reading payload")?;
        if n == 0 {
            break;
        }
        written += n as u64;
        if written > size {
            anyhow::bail!("payload is larger than the declared {size} bytes");
        }
        writer
            .write(buf[..n].to_vec())
            .await
            .with_context(|| format!("writing at offset {}", written - n as u64))?;
    }

    if written != size {
        anyhow::bail!("payload ended after {written} of {size} declared bytes");
    }
    Ok(())
}

fn write_error(path: &str, source: anyhow::Error) -> StowError {
    StowError::BackendWrite {
        path: path.to_string(),
        source,
    }
}
