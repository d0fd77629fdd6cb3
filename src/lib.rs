//! Database adapters.
//!
//! Two connection providers behind one small contract:
//! a pooled PostgreSQL backend that closes each connection when its scope
//! ends, and a SQLite backend that caches a single connection.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{BackendConfig, Config};
pub use db::{Backend, PooledBackend, ScopedConnection, SingleConnectionBackend};
pub use error::{DbError, DbResult};
