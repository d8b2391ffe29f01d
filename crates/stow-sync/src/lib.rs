//! stow-sync: upload pipeline with stage hooks, metadata catalog, and the
//! reconciler that keeps the catalog in line with what is on disk

pub mod filesystem;
pub mod hook;
pub mod mime;
pub mod reconcile;
pub mod store;
pub mod stream;

pub use filesystem::FileSystem;
pub use hook::{hook_fn, Chain, Hook, HookContext, PersistRecord, ValidateCapacity, ValidateFile};
pub use reconcile::{Reconciler, SyncSummary, UserOutcome, UserStatus, UserSyncReport, WalkRules};
pub use store::{Catalog, JsonCatalog, MetadataStore};
pub use stream::{FileStream, StreamMode};
