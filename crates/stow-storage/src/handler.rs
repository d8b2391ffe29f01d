//! The storage handler contract.
//!
//! A handler is the only component that touches physical storage. It has to
//! honor two guarantees:
//!   - `put` either stores the complete object or leaves nothing visible,
//!     including when the cancellation token fires mid-transfer.
//!   - `delete` attempts every path and reports the subset it removed, even
//!     when some paths fail.

use async_trait::async_trait;
use std::sync::Arc;
use stow_core::{Policy, StowResult};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

/// Readable upload content
pub type Payload = Box<dyn AsyncRead + Send + Sync + Unpin>;

#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// Store `size` bytes read from `content` at `dst`.
    ///
    /// Fails with `StowError::Cancelled` if `cancel` fires and with
    /// `StowError::BackendWrite` for any other failure.
    async fn put(
        &self,
        cancel: &CancellationToken,
        content: Payload,
        dst: &str,
        size: u64,
    ) -> StowResult<()>;

    /// Remove `paths`, returning the ones that were removed.
    ///
    /// On partial failure returns `StowError::BackendDelete` whose `deleted`
    /// field lists the successful subset.
    async fn delete(&self, cancel: &CancellationToken, paths: &[String]) -> StowResult<Vec<String>>;
}

/// Resolves the handler a policy stores into.
pub trait HandlerFactory: Send + Sync {
    fn handler_for(&self, policy: &Policy) -> StowResult<Arc<dyn StorageHandler>>;
}
