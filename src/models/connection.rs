//! Connection-related data models.
//!
//! This module defines the backend kinds and the metadata reported for a
//! connection handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::SQLite => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// What happens to a handle when its scope ends.
///
/// The two backends deliberately differ: pooled connections are closed on
/// scope exit, the cached SQLite connection stays open for the next caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    CloseOnExit,
    KeepOpen,
}

impl std::fmt::Display for ReleasePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CloseOnExit => write!(f, "close_on_exit"),
            Self::KeepOpen => write!(f, "keep_open"),
        }
    }
}

/// Metadata about a live connection handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub id: Uuid,
    pub db_type: DatabaseType,
    pub opened_at: DateTime<Utc>,
    pub release_policy: ReleasePolicy,
}

impl HandleInfo {
    pub(crate) fn new(db_type: DatabaseType, release_policy: ReleasePolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            db_type,
            opened_at: Utc::now(),
            release_policy,
        }
    }
}
