//! Data models for the database adapters.

pub mod connection;

pub use connection::{DatabaseType, HandleInfo, ReleasePolicy};
