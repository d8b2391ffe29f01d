//! Storage health check

use anyhow::Result;
use opendal::Operator;

/// Verify the backend is reachable by listing its root
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}
