//! Metadata store: users, policies, and file records.
//!
//! `MetadataStore` is the only way the pipeline and the reconciler reach the
//! catalog, so tests can swap in their own implementation.
//!
//! `JsonCatalog` keeps the whole catalog in memory. Mutations only mark it
//! dirty; `flush` (or dropping the catalog) rewrites the backing file
//! atomically (temp file + rename).

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use stow_core::{FileRecord, NewFileRecord, Policy, StowError, StowResult, User};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn list_users(&self) -> StowResult<Vec<User>>;
    async fn get_policy(&self, id: u64) -> StowResult<Policy>;
    async fn list_files(&self, user_id: u64) -> StowResult<Vec<FileRecord>>;
    /// The record named `name` in `virtual_path` of user `user_id`, if any.
    async fn find_file(
        &self,
        user_id: u64,
        virtual_path: &str,
        name: &str,
    ) -> StowResult<Option<FileRecord>>;
    async fn create_file(&self, file: NewFileRecord) -> StowResult<FileRecord>;
    /// Remove records by id in one batch; unknown ids are ignored.
    async fn delete_files(&self, ids: &[u64]) -> StowResult<()>;

    /// Make earlier mutations durable. Stores that write through need not
    /// override this.
    async fn flush(&self) -> StowResult<()> {
        Ok(())
    }
}

/// A virtual folder owned by one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: u64,
    pub user_id: u64,
    pub path: String,
}

/// Serialized catalog contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub users: Vec<User>,
    pub policies: Vec<Policy>,
    pub folders: Vec<Folder>,
    pub files: Vec<FileRecord>,
    /// Last assigned file id
    pub file_seq: u64,
    /// Last assigned folder id
    pub folder_seq: u64,
}

impl Catalog {
    /// Raise the id sequences above any id already present.
    fn repair_sequences(&mut self) {
        let max_file = self.files.iter().map(|f| f.id).max().unwrap_or(0);
        let max_folder = self.folders.iter().map(|f| f.id).max().unwrap_or(0);
        self.file_seq = self.file_seq.max(max_file);
        self.folder_seq = self.folder_seq.max(max_folder);
    }

    fn ensure_folder(&mut self, user_id: u64, path: &str) -> u64 {
        if let Some(folder) = self
            .folders
            .iter()
            .find(|f| f.user_id == user_id && f.path == path)
        {
            return folder.id;
        }
        self.folder_seq += 1;
        self.folders.push(Folder {
            id: self.folder_seq,
            user_id,
            path: path.to_string(),
        });
        self.folder_seq
    }
}

/// (user, virtual path, name) -> file id
type NameIndex = HashMap<(u64, String, String), u64>;

struct State {
    catalog: Catalog,
    by_name: NameIndex,
    dirty: bool,
}

impl State {
    fn new(mut catalog: Catalog) -> Self {
        catalog.repair_sequences();
        let by_name = catalog
            .files
            .iter()
            .map(|f| ((f.user_id, f.virtual_path.clone(), f.name.clone()), f.id))
            .collect();
        Self {
            catalog,
            by_name,
            dirty: false,
        }
    }
}

pub struct JsonCatalog {
    /// None for a purely in-memory catalog
    path: Option<PathBuf>,
    inner: Mutex<State>,
    /// Serializes flushes so writers never race on the temp file
    writer: tokio::sync::Mutex<()>,
}

impl JsonCatalog {
    /// Load the catalog at `path`, starting empty if the file doesn't exist.
    pub fn open(path: &Path) -> StowResult<Self> {
        let catalog: Catalog = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading catalog: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing catalog: {}", path.display()))?
        } else {
            Catalog::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            inner: Mutex::new(State::new(catalog)),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    pub fn in_memory() -> Self {
        Self::from_catalog(Catalog::default())
    }

    pub fn from_catalog(catalog: Catalog) -> Self {
        Self {
            path: None,
            inner: Mutex::new(State::new(catalog)),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn add_user(&self, user: User) -> StowResult<()> {
        let mut state = self.lock()?;
        state.catalog.users.retain(|u| u.id != user.id);
        state.catalog.users.push(user);
        state.dirty = true;
        Ok(())
    }

    pub fn add_policy(&self, policy: Policy) -> StowResult<()> {
        let mut state = self.lock()?;
        state.catalog.policies.retain(|p| p.id != policy.id);
        state.catalog.policies.push(policy);
        state.dirty = true;
        Ok(())
    }

    /// Copy of the current catalog contents.
    pub fn snapshot(&self) -> StowResult<Catalog> {
        Ok(self.lock()?.catalog.clone())
    }

    /// Whether there are mutations not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().map(|s| s.dirty).unwrap_or(false)
    }

    fn lock(&self) -> StowResult<MutexGuard<'_, State>> {
        self.inner
            .lock()
            .map_err(|_| StowError::Metadata("catalog lock poisoned".into()))
    }
}

/// Atomic write: write to temp file, then rename.
fn write_catalog(path: &Path, catalog: &Catalog) -> StowResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating catalog dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(catalog).context("serializing catalog")?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)
        .with_context(|| format!("writing catalog temp: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming catalog: {}", path.display()))?;
    Ok(())
}

/// Async twin of `write_catalog` for already serialized contents.
async fn write_json(path: &Path, json: String) -> StowResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating catalog dir: {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .with_context(|| format!("writing catalog temp: {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming catalog: {}", path.display()))?;
    Ok(())
}

impl Drop for JsonCatalog {
    fn drop(&mut self) {
        let (Some(path), Ok(state)) = (&self.path, self.inner.get_mut()) else {
            return;
        };
        if state.dirty {
            if let Err(e) = write_catalog(path, &state.catalog) {
                tracing::warn!("failed to flush catalog on drop: {e}");
            }
        }
    }
}

#[async_trait]
impl MetadataStore for JsonCatalog {
    async fn list_users(&self) -> StowResult<Vec<User>> {
        Ok(self.lock()?.catalog.users.clone())
    }

    async fn get_policy(&self, id: u64) -> StowResult<Policy> {
        self.lock()?
            .catalog
            .policies
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| StowError::Metadata(format!("policy {id} not found")))
    }

    async fn list_files(&self, user_id: u64) -> StowResult<Vec<FileRecord>> {
        Ok(self
            .lock()?
            .catalog
            .files
            .iter()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_file(
        &self,
        user_id: u64,
        virtual_path: &str,
        name: &str,
    ) -> StowResult<Option<FileRecord>> {
        let state = self.lock()?;
        let key = (user_id, virtual_path.to_string(), name.to_string());
        let Some(&id) = state.by_name.get(&key) else {
            return Ok(None);
        };
        Ok(state.catalog.files.iter().find(|f| f.id == id).cloned())
    }

    async fn create_file(&self, file: NewFileRecord) -> StowResult<FileRecord> {
        let mut state = self.lock()?;
        let folder_id = state
            .catalog
            .ensure_folder(file.user_id, &file.virtual_path);
        state.catalog.file_seq += 1;

        let record = FileRecord {
            id: state.catalog.file_seq,
            user_id: file.user_id,
            name: file.name,
            source_name: file.source_name,
            folder_id,
            virtual_path: file.virtual_path,
            size: file.size,
            mime_type: file.mime_type,
            policy_id: file.policy_id,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        state.by_name.insert(
            (record.user_id, record.virtual_path.clone(), record.name.clone()),
            record.id,
        );
        state.catalog.files.push(record.clone());
        state.dirty = true;
        Ok(record)
    }

    async fn delete_files(&self, ids: &[u64]) -> StowResult<()> {
        let ids: HashSet<u64> = ids.iter().copied().collect();
        let mut state = self.lock()?;
        let before = state.catalog.files.len();
        state.catalog.files.retain(|f| !ids.contains(&f.id));
        if state.catalog.files.len() != before {
            state.by_name.retain(|_, id| !ids.contains(id));
            state.dirty = true;
        }
        Ok(())
    }

    async fn flush(&self) -> StowResult<()> {
        let _writing = self.writer.lock().await;
        let (path, json) = {
            let mut state = self.lock()?;
            if !state.dirty {
                return Ok(());
            }
            let Some(path) = &self.path else {
                state.dirty = false;
                return Ok(());
            };
            let json = serde_json::to_string_pretty(&state.catalog).context("serializing catalog")?;
            state.dirty = false;
            (path, json)
        };

        if let Err(e) = write_json(path, json).await {
            self.lock()?.dirty = true;
            return Err(e);
        }
        Ok(())
    }
}
