//! FileSystem: one user's view of storage for the duration of a session.
//!
//! Binds a user, their policy, a storage handler, the metadata store, and
//! the hook pipeline. The upload pipeline is fixed:
//!
//!   BeforeUpload hook → handler.put (transfer mode only) → AfterUpload hook
//!
//! A failing BeforeUpload hook leaves no side effects. A failing put runs no
//! further stages. A failing AfterUpload hook does not remove the stored
//! object; compensation is the caller's explicit call to `delete`.

use std::collections::HashMap;
use std::sync::Arc;

use stow_core::types::HookStage;
use stow_core::{FileRecord, Policy, StowError, StowResult, User};
use stow_storage::StorageHandler;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hook::{Chain, Hook, HookContext, PersistRecord, ValidateCapacity, ValidateFile};
use crate::store::MetadataStore;
use crate::stream::{FileStream, StreamMode};

pub struct FileSystem {
    user: User,
    policy: Policy,
    handler: Arc<dyn StorageHandler>,
    store: Arc<dyn MetadataStore>,
    hooks: HashMap<HookStage, Arc<dyn Hook>>,
}

impl FileSystem {
    pub fn new(
        user: User,
        policy: Policy,
        handler: Arc<dyn StorageHandler>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            user,
            policy,
            handler,
            store,
            hooks: HashMap::new(),
        }
    }

    /// Bind the stock pipeline: file and capacity validation before the
    /// upload, record persistence after it.
    pub fn with_default_hooks(mut self) -> Self {
        self.use_hook(
            HookStage::BeforeUpload,
            Arc::new(Chain(vec![Arc::new(ValidateFile), Arc::new(ValidateCapacity)])),
        );
        self.use_hook(HookStage::AfterUpload, Arc::new(PersistRecord));
        self
    }

    /// Bind `hook` to `stage`, replacing whatever was bound there.
    pub fn use_hook(&mut self, stage: HookStage, hook: Arc<dyn Hook>) {
        self.bind(stage, Some(hook));
    }

    /// Bind or clear a stage. Returns the previously bound hook.
    pub fn bind(&mut self, stage: HookStage, hook: Option<Arc<dyn Hook>>) -> Option<Arc<dyn Hook>> {
        match hook {
            Some(hook) => self.hooks.insert(stage, hook),
            None => self.hooks.remove(&stage),
        }
    }

    pub fn has_hook(&self, stage: HookStage) -> bool {
        self.hooks.contains_key(&stage)
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn handler(&self) -> &Arc<dyn StorageHandler> {
        &self.handler
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// Run the upload pipeline for one file.
    ///
    /// Transfer streams are written to the destination the policy derives
    /// from the stream's virtual path and name. Register-only streams skip
    /// the backend entirely and are recorded at their save path.
    ///
    /// Records are durable once the store is flushed.
    pub async fn upload(&self, cancel: &CancellationToken, mut file: FileStream) -> StowResult<()> {
        self.run_hook(HookStage::BeforeUpload, cancel, &file, None)
            .await?;

        let destination = match file.mode() {
            StreamMode::Transfer => {
                let dst = self
                    .policy
                    .destination(self.user.id, &file.virtual_path, &file.name)?;
                let content = file.take_content().ok_or_else(|| StowError::BackendWrite {
                    path: dst.clone(),
                    source: anyhow::anyhow!("stream content was already consumed"),
                })?;
                self.handler.put(cancel, content, &dst, file.size).await?;
                dst
            }
            StreamMode::RegisterOnly => file.save_path.clone().ok_or_else(|| {
                StowError::Other(anyhow::anyhow!(
                    "register-only stream {} has no save path",
                    file.name
                ))
            })?,
        };

        if let Err(e) = self
            .run_hook(HookStage::AfterUpload, cancel, &file, Some(destination.as_str()))
            .await
        {
            warn!(
                user = %self.user.email,
                path = %destination,
                "after-upload hook failed, stored object is kept: {e}"
            );
            return Err(e);
        }

        debug!(user = %self.user.email, path = %destination, mode = ?file.mode(), "uploaded");
        Ok(())
    }

    /// Remove `files`, returning the ids whose records were deleted.
    ///
    /// With `unlink_only` only the records go, in a single batch. Otherwise
    /// the physical objects are deleted first and only records whose object
    /// is gone are unlinked; a partial storage failure still unlinks the
    /// successful subset before the error is returned.
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        files: &[FileRecord],
        unlink_only: bool,
    ) -> StowResult<Vec<u64>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        if unlink_only {
            let ids: Vec<u64> = files.iter().map(|f| f.id).collect();
            self.store.delete_files(&ids).await?;
            return Ok(ids);
        }

        let paths: Vec<String> = files.iter().map(|f| f.source_name.clone()).collect();
        match self.handler.delete(cancel, &paths).await {
            Ok(deleted) => self.unlink_deleted(files, &deleted).await,
            Err(StowError::BackendDelete {
                deleted,
                failed,
                reason,
            }) => {
                self.unlink_deleted(files, &deleted).await?;
                Err(StowError::BackendDelete {
                    deleted,
                    failed,
                    reason,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn unlink_deleted(&self, files: &[FileRecord], deleted: &[String]) -> StowResult<Vec<u64>> {
        let ids: Vec<u64> = files
            .iter()
            .filter(|f| deleted.contains(&f.source_name))
            .map(|f| f.id)
            .collect();
        if !ids.is_empty() {
            self.store.delete_files(&ids).await?;
        }
        Ok(ids)
    }

    async fn run_hook(
        &self,
        stage: HookStage,
        cancel: &CancellationToken,
        file: &FileStream,
        destination: Option<&str>,
    ) -> StowResult<()> {
        let Some(hook) = self.hooks.get(&stage) else {
            return Ok(());
        };
        let ctx = HookContext {
            cancel,
            file,
            destination,
        };
        hook.call(&ctx, self)
            .await
            .map_err(|e| StowError::hook(stage, e))
    }
}
