//! Upload pipeline hooks.
//!
//! A `FileSystem` holds at most one hook per `HookStage`; binding a stage
//! again replaces the previous hook. Use `Chain` to run several checks at one
//! stage.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use stow_core::{check_file_name, NewFileRecord};
use tokio_util::sync::CancellationToken;

use crate::filesystem::FileSystem;
use crate::stream::{FileStream, StreamMode};

/// What a hook sees of the operation in flight
pub struct HookContext<'a> {
    pub cancel: &'a CancellationToken,
    pub file: &'a FileStream,
    /// Physical destination; known only after the backend stage
    pub destination: Option<&'a str>,
}

#[async_trait]
pub trait Hook: Send + Sync {
    /// Returning an error aborts the operation with that error.
    async fn call(&self, ctx: &HookContext<'_>, fs: &FileSystem) -> Result<()>;
}

/// Hook backed by a plain closure
pub struct FnHook<F>(F);

/// Wrap a synchronous closure as a hook.
pub fn hook_fn<F>(f: F) -> Arc<dyn Hook>
where
    F: Fn(&HookContext<'_>, &FileSystem) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHook(f))
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&HookContext<'_>, &FileSystem) -> Result<()> + Send + Sync,
{
    async fn call(&self, ctx: &HookContext<'_>, fs: &FileSystem) -> Result<()> {
        (self.0)(ctx, fs)
    }
}

/// Runs hooks in order, stopping at the first failure
pub struct Chain(pub Vec<Arc<dyn Hook>>);

#[async_trait]
impl Hook for Chain {
    async fn call(&self, ctx: &HookContext<'_>, fs: &FileSystem) -> Result<()> {
        for hook in &self.0 {
            hook.call(ctx, fs).await?;
        }
        Ok(())
    }
}

/// Enforces a plain file name, the policy's size limit, and its extension
/// allow-list
pub struct ValidateFile;

#[async_trait]
impl Hook for ValidateFile {
    async fn call(&self, ctx: &HookContext<'_>, fs: &FileSystem) -> Result<()> {
        check_file_name(&ctx.file.name)?;
        let policy = fs.policy();
        if policy.max_size > 0 && ctx.file.size > policy.max_size {
            anyhow::bail!(
                "file {} is {} bytes, policy {} allows at most {}",
                ctx.file.name,
                ctx.file.size,
                policy.id,
                policy.max_size
            );
        }
        if !policy.accepts_extension(&ctx.file.name) {
            anyhow::bail!(
                "file {} has an extension not allowed by policy {}",
                ctx.file.name,
                policy.id
            );
        }
        Ok(())
    }
}

/// Rejects uploads that would push the user past their capacity
pub struct ValidateCapacity;

#[async_trait]
impl Hook for ValidateCapacity {
    async fn call(&self, ctx: &HookContext<'_>, fs: &FileSystem) -> Result<()> {
        let user = fs.user();
        if user.capacity == 0 {
            return Ok(());
        }
        let used: u64 = fs
            .store()
            .list_files(user.id)
            .await?
            .iter()
            .map(|f| f.size)
            .sum();
        if used.saturating_add(ctx.file.size) > user.capacity {
            anyhow::bail!(
                "capacity exceeded for {}: {used} used + {} requested > {}",
                user.email,
                ctx.file.size,
                user.capacity
            );
        }
        Ok(())
    }
}

/// Records the stored file in the metadata store
pub struct PersistRecord;

#[async_trait]
impl Hook for PersistRecord {
    async fn call(&self, ctx: &HookContext<'_>, fs: &FileSystem) -> Result<()> {
        let file = ctx.file;
        let source_name = match file.mode() {
            StreamMode::RegisterOnly => file.save_path.clone(),
            StreamMode::Transfer => ctx.destination.map(str::to_string),
        }
        .ok_or_else(|| anyhow::anyhow!("no physical location for {}", file.name))?;

        let user = fs.user();
        if fs
            .store()
            .find_file(user.id, &file.virtual_path, &file.name)
            .await?
            .is_some()
        {
            anyhow::bail!("file {} already exists in {}", file.name, file.virtual_path);
        }

        fs.store()
            .create_file(NewFileRecord {
                user_id: user.id,
                name: file.name.clone(),
                source_name,
                virtual_path: file.virtual_path.clone(),
                size: file.size,
                mime_type: file.mime_type.clone(),
                policy_id: fs.policy().id,
            })
            .await?;
        Ok(())
    }
}
