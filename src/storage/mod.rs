//! Tracking store for filerelay
//!
//! Handles SQLite database operations, WAL mode, and schema management.

mod connection;
mod migrations;
pub mod queries;

pub use connection::TrackingStore;
pub use migrations::SCHEMA_VERSION;
