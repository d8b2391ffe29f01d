//! stow-storage: pluggable physical storage behind a two-call contract

pub mod backend;
pub mod handler;
pub mod health;
pub mod operator;

pub use backend::OpendalHandler;
pub use handler::{HandlerFactory, Payload, StorageHandler};
pub use health::check_health;
pub use operator::{build_operator, OpendalFactory, S3Credentials};
