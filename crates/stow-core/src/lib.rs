pub mod config;
pub mod error;
pub mod policy;
pub mod types;

pub use error::{StowError, StowResult};
pub use policy::{check_file_name, BackendKind, Policy};
pub use types::{FileRecord, NewFileRecord, User};
