use serde::{Deserialize, Serialize};
use std::fmt;

/// A storage account. The policy is resolved separately per sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
    /// Policy assigned through the user's group
    pub policy_id: u64,
    /// Total bytes the user may store (0 = unlimited)
    #[serde(default)]
    pub capacity: u64,
}

/// A file known to the metadata store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    /// Physical location in forward-slash form; the reconciliation join key
    pub source_name: String,
    pub folder_id: u64,
    /// Virtual folder the file lives in, e.g. `/` or `/photos/2024`
    pub virtual_path: String,
    pub size: u64,
    pub mime_type: String,
    pub policy_id: u64,
    /// Unix timestamp of registration
    pub created_at: u64,
}

/// Insert payload for a new file record; ids are assigned by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileRecord {
    pub user_id: u64,
    pub name: String,
    pub source_name: String,
    pub virtual_path: String,
    pub size: u64,
    pub mime_type: String,
    pub policy_id: u64,
}

/// Fixed extension points of the upload pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookStage {
    /// Runs before the backend sees any bytes; failure aborts with no side effects
    BeforeUpload,
    /// Runs after the backend accepted the object; persists metadata
    AfterUpload,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::BeforeUpload => f.write_str("BeforeUpload"),
            HookStage::AfterUpload => f.write_str("AfterUpload"),
        }
    }
}
