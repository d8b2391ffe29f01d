//! Reconciler: bring the metadata catalog in line with each user's base
//! directory on disk.
//!
//! Per user:
//!   1. base dir = policy.generate_path(uid, "/"); missing ⇒ nothing to do
//!   2. index the user's records by `source_name`
//!   3. walk the base dir; unknown files are registered (no bytes move),
//!      known files are struck from the index
//!   4. whatever is left in the index is gone from disk and is unlinked in
//!      a single batch
//!
//! Pruned directories and suffix-excluded files are invisible in both
//! directions: never registered, and their records never unlinked.
//!
//! The diff key is the path alone. Content changes to a registered file are
//! not detected.
//!
//! Users are independent: one user's failure is recorded in the summary and
//! never stops the others. Concurrent passes over the same user must be
//! prevented by the caller.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use stow_core::types::HookStage;
use stow_core::{FileRecord, Policy, StowError, StowResult, User};
use stow_storage::HandlerFactory;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::filesystem::FileSystem;
use crate::hook::PersistRecord;
use crate::mime::mime_type;
use crate::store::MetadataStore;
use crate::stream::{to_slash, FileStream};

/// Which entries the walk ignores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkRules {
    /// Directories whose name contains this are pruned with their subtree
    pub skip_dir_marker: String,
    /// Files whose name ends with this are ignored
    pub skip_file_suffix: String,
}

impl Default for WalkRules {
    fn default() -> Self {
        Self {
            skip_dir_marker: ".cache".into(),
            skip_file_suffix: "_thumb".into(),
        }
    }
}

impl WalkRules {
    fn prunes_dir(&self, name: &str) -> bool {
        !self.skip_dir_marker.is_empty() && name.contains(&self.skip_dir_marker)
    }

    fn skips_file(&self, name: &str) -> bool {
        !self.skip_file_suffix.is_empty() && name.ends_with(&self.skip_file_suffix)
    }

    /// Whether a record points into a part of `base` the walk never reports.
    /// Such records are left alone instead of being treated as stale.
    fn excludes_record(&self, base: &str, source_name: &str) -> bool {
        let Some(rel) = source_name.strip_prefix(base) else {
            return false;
        };
        if !rel.starts_with('/') && !base.ends_with('/') {
            return false;
        }
        let mut segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        let Some(name) = segments.pop() else {
            return false;
        };
        self.skips_file(name) || segments.iter().any(|dir| self.prunes_dir(dir))
    }
}

/// What one user's pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSyncReport {
    pub base_dir: String,
    /// Base directory did not exist
    pub skipped: bool,
    pub registered: usize,
    pub unchanged: usize,
    /// Stale records unlinked
    pub removed: usize,
    /// Files that could not be registered: (path, reason)
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserStatus {
    Synced(UserSyncReport),
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOutcome {
    pub user_id: u64,
    pub email: String,
    pub status: UserStatus,
}

/// Result of a full pass over every user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub users: Vec<UserOutcome>,
    /// Set when the user list itself could not be loaded
    pub error: Option<String>,
}

impl SyncSummary {
    pub fn failed(&self) -> usize {
        self.users
            .iter()
            .filter(|u| matches!(u.status, UserStatus::Failed { .. }))
            .count()
    }

    pub fn registered(&self) -> usize {
        self.reports().map(|r| r.registered).sum()
    }

    pub fn removed(&self) -> usize {
        self.reports().map(|r| r.removed).sum()
    }

    fn reports(&self) -> impl Iterator<Item = &UserSyncReport> {
        self.users.iter().filter_map(|u| match &u.status {
            UserStatus::Synced(report) => Some(report),
            UserStatus::Failed { .. } => None,
        })
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn MetadataStore>,
    handlers: Arc<dyn HandlerFactory>,
    rules: WalkRules,
    workers: usize,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(store: Arc<dyn MetadataStore>, handlers: Arc<dyn HandlerFactory>) -> Self {
        Self {
            store,
            handlers,
            rules: WalkRules::default(),
            workers: 1,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_rules(mut self, rules: WalkRules) -> Self {
        self.rules = rules;
        self
    }

    /// Number of users reconciled at once (minimum 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Reconcile every user. Never fails: per-user problems are logged and
    /// reported in the summary.
    pub async fn sync(&self) -> SyncSummary {
        let users = match self.store.list_users().await {
            Ok(users) => users,
            Err(e) => {
                error!("loading users: {e}");
                return SyncSummary {
                    users: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let limit = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for user in users {
            let this = self.clone();
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                let status = match this.sync_user(&user).await {
                    Ok(report) => UserStatus::Synced(report),
                    Err(e) => {
                        error!(user = %user.email, "sync failed: {e}");
                        UserStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                UserOutcome {
                    user_id: user.id,
                    email: user.email,
                    status,
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("user sync task aborted: {e}"),
            }
        }
        outcomes.sort_by_key(|o| o.user_id);

        let summary = SyncSummary {
            users: outcomes,
            error: None,
        };
        info!(
            users = summary.users.len(),
            failed = summary.failed(),
            registered = summary.registered(),
            removed = summary.removed(),
            "sync pass complete"
        );
        summary
    }

    /// Load the user's policy, then reconcile their files.
    pub async fn sync_user(&self, user: &User) -> StowResult<UserSyncReport> {
        let policy = self.store.get_policy(user.policy_id).await.map_err(|e| {
            error!(user = %user.email, policy = user.policy_id, "loading policy: {e}");
            e
        })?;
        self.sync_user_files(user, &policy).await
    }

    /// Diff one user's base directory against their records and apply it.
    ///
    /// The store is flushed once at the end of the pass, whether or not it
    /// succeeded.
    pub async fn sync_user_files(&self, user: &User, policy: &Policy) -> StowResult<UserSyncReport> {
        let result = self.diff_user_files(user, policy).await;
        let flushed = self.store.flush().await;
        let report = result?;
        flushed?;
        Ok(report)
    }

    async fn diff_user_files(&self, user: &User, policy: &Policy) -> StowResult<UserSyncReport> {
        let handler = self.handlers.handler_for(policy)?;
        let mut fs = FileSystem::new(user.clone(), policy.clone(), handler, self.store.clone());
        fs.use_hook(HookStage::AfterUpload, Arc::new(PersistRecord));

        let base_dir = policy.generate_path(user.id, "/");
        let base = PathBuf::from(&base_dir);
        let mut report = UserSyncReport {
            base_dir: base_dir.clone(),
            ..Default::default()
        };

        match tokio::fs::metadata(&base).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(user = %user.email, base = %base_dir, "base directory missing, skipping");
                report.skipped = true;
                return Ok(report);
            }
            Err(e) => return Err(traversal(&base, e)),
        }

        let mut known: HashMap<String, FileRecord> = self
            .store
            .list_files(user.id)
            .await?
            .into_iter()
            .filter(|f| !self.rules.excludes_record(&base_dir, &f.source_name))
            .map(|f| (f.source_name.clone(), f))
            .collect();

        let on_disk = {
            let base = base.clone();
            let rules = self.rules.clone();
            let cancel = self.cancel.clone();
            tokio::task::spawn_blocking(move || scan(&base, &rules, &cancel))
                .await
                .map_err(|e| StowError::Other(anyhow::anyhow!("walk of {base_dir} aborted: {e}")))??
        };

        for found in on_disk {
            if self.cancel.is_cancelled() {
                return Err(StowError::Cancelled);
            }
            if known.remove(&found.current).is_some() {
                report.unchanged += 1;
                continue;
            }

            match self.register(&fs, &base, &found).await {
                Ok(()) => report.registered += 1,
                Err(e) => {
                    warn!(user = %user.email, path = %found.current, "registering failed: {e}");
                    report.failed.push((found.current, e.to_string()));
                }
            }
        }

        let stale: Vec<FileRecord> = known.into_values().collect();
        if !stale.is_empty() {
            let removed = fs.delete(&self.cancel, &stale, true).await?;
            report.removed = removed.len();
        }

        info!(
            user = %user.email,
            base = %base_dir,
            registered = report.registered,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed.len(),
            "user synced"
        );
        Ok(report)
    }

    /// Record a file that already sits in the user's base directory.
    async fn register(&self, fs: &FileSystem, base: &Path, found: &DiskFile) -> StowResult<()> {
        let meta = tokio::fs::metadata(&found.path).await?;
        let rel_dir = found
            .path
            .parent()
            .and_then(|parent| parent.strip_prefix(base).ok())
            .map(to_slash)
            .unwrap_or_default();

        let file = FileStream::register_only(
            found.name.clone(),
            &format!("/{rel_dir}"),
            meta.len(),
            &found.current,
        )
        .with_mime_type(mime_type(&found.path));
        fs.upload(&self.cancel, file).await
    }
}

/// A regular file the walk reported
#[derive(Debug)]
struct DiskFile {
    path: PathBuf,
    /// `path` with forward slashes, as stored in `source_name`
    current: String,
    name: String,
}

/// Depth-first walk of `base` in name order, applying `rules`. Blocking.
fn scan(base: &Path, rules: &WalkRules, cancel: &CancellationToken) -> StowResult<Vec<DiskFile>> {
    let mut files = Vec::new();
    let mut pending = vec![base.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = read_dir_sorted(&dir)?;
        let mut subdirs = Vec::new();

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(StowError::Cancelled);
            }

            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().map_err(|e| traversal(&path, e))?;

            if file_type.is_dir() {
                if rules.prunes_dir(&name) {
                    debug!(path = %path.display(), "pruned directory");
                } else {
                    subdirs.push(path);
                }
                continue;
            }
            if !file_type.is_file() || rules.skips_file(&name) {
                continue;
            }

            files.push(DiskFile {
                current: to_slash(&path),
                path,
                name,
            });
        }

        // Reverse so the stack yields subdirectories in name order
        pending.extend(subdirs.into_iter().rev());
    }
    Ok(files)
}

fn read_dir_sorted(dir: &Path) -> StowResult<Vec<std::fs::DirEntry>> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| traversal(dir, e))?
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| traversal(dir, e))?;
    entries.sort_by_key(|e| e.file_name());
    Ok(entries)
}

fn traversal(path: &Path, source: io::Error) -> StowError {
    StowError::Traversal {
        path: path.to_path_buf(),
        source,
    }
}
