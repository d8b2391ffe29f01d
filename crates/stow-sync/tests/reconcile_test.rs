//! Integration tests: reconciling on-disk trees against the catalog
//!
//! Each test builds a real directory tree in a TempDir and a memory-backed
//! policy. Register-only uploads never touch storage, so the catalog is the
//! only thing that changes.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use stow_core::{BackendKind, FileRecord, NewFileRecord, Policy, StowError, StowResult, User};
use stow_storage::OpendalFactory;
use stow_sync::stream::to_slash;
use stow_sync::{JsonCatalog, MetadataStore, Reconciler, UserStatus, WalkRules};

/// Wraps a JsonCatalog and counts the calls the reconciler makes
struct RecordingStore {
    inner: JsonCatalog,
    creates: AtomicUsize,
    delete_batches: Mutex<Vec<Vec<u64>>>,
    flushes: AtomicUsize,
    fail_users: bool,
}

impl RecordingStore {
    fn new() -> Self {
        Self::over(JsonCatalog::in_memory())
    }

    fn over(inner: JsonCatalog) -> Self {
        Self {
            inner,
            creates: AtomicUsize::new(0),
            delete_batches: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            fail_users: false,
        }
    }

    fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    fn delete_batches(&self) -> Vec<Vec<u64>> {
        self.delete_batches.lock().unwrap().clone()
    }

    fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    fn reset_counters(&self) {
        self.creates.store(0, Ordering::SeqCst);
        self.flushes.store(0, Ordering::SeqCst);
        self.delete_batches.lock().unwrap().clear();
    }
}

#[async_trait]
impl MetadataStore for RecordingStore {
    async fn list_users(&self) -> StowResult<Vec<User>> {
        if self.fail_users {
            return Err(StowError::Metadata("database unavailable".into()));
        }
        self.inner.list_users().await
    }

    async fn get_policy(&self, id: u64) -> StowResult<Policy> {
        self.inner.get_policy(id).await
    }

    async fn list_files(&self, user_id: u64) -> StowResult<Vec<FileRecord>> {
        self.inner.list_files(user_id).await
    }

    async fn find_file(
        &self,
        user_id: u64,
        virtual_path: &str,
        name: &str,
    ) -> StowResult<Option<FileRecord>> {
        self.inner.find_file(user_id, virtual_path, name).await
    }

    async fn create_file(&self, file: NewFileRecord) -> StowResult<FileRecord> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_file(file).await
    }

    async fn delete_files(&self, ids: &[u64]) -> StowResult<()> {
        self.delete_batches.lock().unwrap().push(ids.to_vec());
        self.inner.delete_files(ids).await
    }

    async fn flush(&self) -> StowResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.inner.flush().await
    }
}

fn write_file(root: &Path, rel: &str, content: &[u8]) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).expect("write test file");
    path
}

fn user(id: u64, policy_id: u64) -> User {
    User {
        id,
        email: format!("user{id}@stow.test"),
        policy_id,
        capacity: 0,
    }
}

/// Memory-backed policy whose base dir for user N is `<root>/N`
fn policy(root: &Path) -> Policy {
    Policy {
        id: 1,
        backend: BackendKind::Memory,
        dir_name_rule: format!("{}/{{uid}}/{{path}}", to_slash(root)),
        ..Default::default()
    }
}

fn reconciler(store: Arc<RecordingStore>) -> Reconciler {
    Reconciler::new(store, Arc::new(OpendalFactory::default()))
}

/// Relative source names of a user's records
async fn recorded(store: &RecordingStore, base: &Path, user_id: u64) -> BTreeSet<String> {
    let prefix = format!("{}/", to_slash(base));
    store
        .list_files(user_id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.source_name.trim_start_matches(&prefix).to_string())
        .collect()
}

async fn seed_record(store: &RecordingStore, user_id: u64, path: &Path, virtual_path: &str) -> u64 {
    store
        .inner
        .create_file(NewFileRecord {
            user_id,
            name: path.file_name().unwrap().to_string_lossy().into_owned(),
            source_name: to_slash(path),
            virtual_path: virtual_path.into(),
            size: 1,
            mime_type: "text/plain".into(),
            policy_id: 1,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn registers_new_files_then_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("1");
    write_file(&base, "a.txt", b"alpha");
    write_file(&base, "b/c.txt", b"charlie");

    let store = Arc::new(RecordingStore::new());
    let rec = reconciler(store.clone());
    let u = user(1, 1);
    let p = policy(tmp.path());

    let report = rec.sync_user_files(&u, &p).await.expect("first sync");
    assert_eq!(report.registered, 2);
    assert_eq!(report.removed, 0);
    assert!(report.failed.is_empty());

    let expected: BTreeSet<String> = ["a.txt", "b/c.txt"].iter().map(|s| s.to_string()).collect();
    assert_eq!(recorded(&store, &base, 1).await, expected);

    let files = store.list_files(1).await.unwrap();
    let c = files.iter().find(|f| f.name == "c.txt").unwrap();
    assert_eq!(c.virtual_path, "/b");
    assert_eq!(c.size, 7);
    assert_eq!(c.mime_type, "text/plain");
    let a = files.iter().find(|f| f.name == "a.txt").unwrap();
    assert_eq!(a.virtual_path, "/");

    // Second pass with no disk changes does nothing
    store.reset_counters();
    let again = rec.sync_user_files(&u, &p).await.expect("second sync");
    assert_eq!(again.registered, 0);
    assert_eq!(again.unchanged, 2);
    assert_eq!(again.removed, 0);
    assert_eq!(store.creates(), 0);
    assert!(store.delete_batches().is_empty());
}

#[tokio::test]
async fn stale_records_removed_in_one_batch() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("1");
    let a = write_file(&base, "a.txt", b"a");

    let store = Arc::new(RecordingStore::new());
    seed_record(&store, 1, &a, "/").await;
    let b_id = seed_record(&store, 1, &base.join("b.txt"), "/").await;

    let report = reconciler(store.clone())
        .sync_user_files(&user(1, 1), &policy(tmp.path()))
        .await
        .expect("sync");

    assert_eq!(report.registered, 0);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(store.creates(), 0, "a.txt must not be re-registered");
    assert_eq!(store.delete_batches(), vec![vec![b_id]]);

    let expected: BTreeSet<String> = ["a.txt".to_string()].into_iter().collect();
    assert_eq!(recorded(&store, &base, 1).await, expected);
}

#[tokio::test]
async fn excluded_entries_are_invisible() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("1");
    write_file(&base, "keep.txt", b"k");
    write_file(&base, "foo.cache/inner.txt", b"i");
    write_file(&base, "foo.cache/deep/more.txt", b"m");
    let thumb = write_file(&base, "image_thumb", b"t");

    let store = Arc::new(RecordingStore::new());
    // Records inside excluded zones, one present on disk and one not
    seed_record(&store, 1, &thumb, "/").await;
    seed_record(&store, 1, &base.join("old_thumb"), "/").await;
    seed_record(&store, 1, &base.join("foo.cache/inner.txt"), "/foo.cache").await;
    store.reset_counters();

    let report = reconciler(store.clone())
        .sync_user_files(&user(1, 1), &policy(tmp.path()))
        .await
        .expect("sync");

    assert_eq!(report.registered, 1);
    assert_eq!(report.removed, 0);
    assert!(store.delete_batches().is_empty());

    let names: BTreeSet<String> = recorded(&store, &base, 1).await;
    assert!(names.contains("keep.txt"));
    assert!(names.contains("image_thumb"));
    assert!(names.contains("old_thumb"));
    assert!(!names.contains("foo.cache/deep/more.txt"));
}

#[tokio::test]
async fn custom_walk_rules() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("1");
    write_file(&base, "a.txt", b"a");
    write_file(&base, "a.txt_preview", b"p");
    write_file(&base, "build.tmp/x.txt", b"x");
    write_file(&base, "photo_thumb", b"t");

    let store = Arc::new(RecordingStore::new());
    let rules = WalkRules {
        skip_dir_marker: ".tmp".into(),
        skip_file_suffix: "_preview".into(),
    };
    let report = reconciler(store.clone())
        .with_rules(rules)
        .sync_user_files(&user(1, 1), &policy(tmp.path()))
        .await
        .expect("sync");

    assert_eq!(report.registered, 2);
    let expected: BTreeSet<String> = ["a.txt", "photo_thumb"].iter().map(|s| s.to_string()).collect();
    assert_eq!(recorded(&store, &base, 1).await, expected);
}

#[tokio::test]
async fn missing_base_dir_is_not_an_error() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(RecordingStore::new());
    let stale = seed_record(&store, 1, &tmp.path().join("1/gone.txt"), "/").await;

    let report = reconciler(store.clone())
        .sync_user_files(&user(1, 1), &policy(tmp.path()))
        .await
        .expect("missing base dir is skipped");

    assert!(report.skipped);
    assert!(store.delete_batches().is_empty());
    assert_eq!(store.list_files(1).await.unwrap()[0].id, stale);
}

#[tokio::test]
async fn failed_registration_does_not_stop_walk() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("1");
    write_file(&base, "a.txt", b"a");
    write_file(&base, "z.txt", b"z");

    let store = Arc::new(RecordingStore::new());
    // Same virtual name, different physical file: registering a.txt collides
    let elsewhere = seed_record(&store, 1, &tmp.path().join("elsewhere/a.txt"), "/").await;

    let report = reconciler(store.clone())
        .sync_user_files(&user(1, 1), &policy(tmp.path()))
        .await
        .expect("sync");

    assert_eq!(report.registered, 1);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].0.ends_with("/1/a.txt"));
    assert!(report.failed[0].1.contains("already exists"));
    // The record outside the base dir has no file on disk and is unlinked
    assert_eq!(store.delete_batches(), vec![vec![elsewhere]]);
}

#[tokio::test]
async fn cancelled_walk_reports_cancellation() {
    let tmp = TempDir::new().unwrap();
    write_file(&tmp.path().join("1"), "a.txt", b"a");

    let store = Arc::new(RecordingStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = reconciler(store.clone())
        .with_cancellation(cancel)
        .sync_user_files(&user(1, 1), &policy(tmp.path()))
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "got {err:?}");
    assert_eq!(store.creates(), 0);
}

#[tokio::test]
async fn sync_isolates_user_failures() {
    let tmp = TempDir::new().unwrap();
    write_file(&tmp.path().join("1"), "a.txt", b"a");
    write_file(&tmp.path().join("3"), "b.txt", b"b");

    let store = Arc::new(RecordingStore::new());
    store.inner.add_policy(policy(tmp.path())).unwrap();
    store.inner.add_user(user(1, 1)).unwrap();
    store.inner.add_user(user(2, 99)).unwrap();
    store.inner.add_user(user(3, 1)).unwrap();

    let summary = reconciler(store.clone()).with_workers(2).sync().await;

    assert!(summary.error.is_none());
    assert_eq!(summary.users.len(), 3);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.registered(), 2);

    let ids: Vec<u64> = summary.users.iter().map(|u| u.user_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    match &summary.users[1].status {
        UserStatus::Failed { reason } => assert!(reason.contains("policy 99"), "got {reason}"),
        other => panic!("expected failure for user 2, got {other:?}"),
    }
    assert!(matches!(summary.users[0].status, UserStatus::Synced(_)));
}

#[tokio::test]
async fn sync_survives_user_listing_failure() {
    let store = Arc::new(RecordingStore {
        fail_users: true,
        ..RecordingStore::new()
    });

    let summary = reconciler(store).sync().await;

    assert!(summary.users.is_empty());
    assert!(summary.error.unwrap().contains("database unavailable"));
}

#[tokio::test]
async fn catalog_written_once_per_user_pass() {
    let tmp = TempDir::new().unwrap();
    let base = tmp.path().join("data/1");
    for i in 0..200 {
        write_file(&base, &format!("d{}/f{i:03}.txt", i % 4), b"x");
    }
    let catalog_path = tmp.path().join("catalog.json");
    let store = Arc::new(RecordingStore::over(
        JsonCatalog::open(&catalog_path).unwrap(),
    ));

    let report = reconciler(store.clone())
        .sync_user_files(&user(1, 1), &policy(&tmp.path().join("data")))
        .await
        .expect("sync");

    assert_eq!(report.registered, 200);
    assert_eq!(store.creates(), 200);
    assert_eq!(store.flushes(), 1);
    assert!(!store.inner.is_dirty());

    let on_disk = JsonCatalog::open(&catalog_path).unwrap();
    assert_eq!(on_disk.list_files(1).await.unwrap().len(), 200);
}
