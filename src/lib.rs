//! filerelay - remote file collection and forwarding
//!
//! Periodically discovers new files at a remote location, stages them
//! locally, optionally decrypts them, forwards them to a destination tree
//! and reclaims space once they age out. Per-file progress lives in a small
//! SQLite table so restarts neither lose nor re-deliver files.

pub mod config;
pub mod decrypt;
pub mod error;
pub mod logging;
pub mod remote;
pub mod staging;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{RelayError, Result};
pub use staging::LocalStaging;
pub use storage::TrackingStore;
pub use sync::SyncEngine;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
