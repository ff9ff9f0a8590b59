pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod models;
pub mod protocol;

pub use config::*;
pub use errors::*;
pub use models::*;
pub use protocol::*;

pub type SyncResult<T> = Result<T, SyncError>;
