//! Uniform access to both backends.

use crate::config::BackendConfig;
use crate::db::pooled::{PooledBackend, PooledConnection};
use crate::db::single::{SingleConnectionBackend, SqliteHandle};
use crate::dispatch_backend;
use crate::error::DbResult;
use crate::models::{DatabaseType, HandleInfo, ReleasePolicy};
use tracing::debug;

/// A configured connection provider.
#[derive(Debug)]
pub enum Backend {
    Postgres(PooledBackend),
    Sqlite(SingleConnectionBackend),
}

impl Backend {
    /// Construct the backend described by `config`. No connection is opened.
    pub fn new(config: BackendConfig) -> DbResult<Self> {
        let backend = match config {
            BackendConfig::Postgres(pg) => Self::Postgres(PooledBackend::new(pg)?),
            BackendConfig::Sqlite(sqlite) => Self::Sqlite(SingleConnectionBackend::new(sqlite)?),
        };
        debug!(db_type = %backend.db_type(), "Backend configured");
        Ok(backend)
    }

    /// Construct a backend from an option mapping (see [`BackendConfig::from_map`]).
    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> DbResult<Self> {
        Self::new(BackendConfig::from_map(map)?)
    }

    pub fn db_type(&self) -> DatabaseType {
        dispatch_backend!(self, {
            Postgres(b) => b.db_type(),
            Sqlite(b) => b.db_type(),
        })
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        dispatch_backend!(self, {
            Postgres(b) => b.release_policy(),
            Sqlite(b) => b.release_policy(),
        })
    }

    /// Acquire a handle for one scope. Call [`ScopedConnection::release`]
    /// when the scope ends; what that does depends on the backend.
    pub async fn scoped_connection(&self) -> DbResult<ScopedConnection> {
        dispatch_backend!(self, {
            Postgres(b) => b.scoped_connection().await.map(ScopedConnection::Pooled),
            Sqlite(b) => b.scoped_connection().await.map(ScopedConnection::Single),
        })
    }

    /// Release long-lived resources: the shared pool or the cached connection.
    pub async fn close(&self) -> DbResult<()> {
        match self {
            Self::Postgres(b) => {
                b.close().await;
                Ok(())
            }
            Self::Sqlite(b) => b.close().await,
        }
    }

    pub fn as_pooled(&self) -> Option<&PooledBackend> {
        match self {
            Self::Postgres(b) => Some(b),
            Self::Sqlite(_) => None,
        }
    }

    pub fn as_single(&self) -> Option<&SingleConnectionBackend> {
        match self {
            Self::Sqlite(b) => Some(b),
            Self::Postgres(_) => None,
        }
    }
}

/// Handle returned by [`Backend::scoped_connection`].
#[derive(Debug)]
pub enum ScopedConnection {
    Pooled(PooledConnection),
    Single(SqliteHandle),
}

impl ScopedConnection {
    pub fn info(&self) -> &HandleInfo {
        match self {
            Self::Pooled(c) => c.info(),
            Self::Single(h) => h.info(),
        }
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.info().release_policy
    }

    pub async fn server_version(&mut self) -> DbResult<String> {
        match self {
            Self::Pooled(c) => c.server_version().await,
            Self::Single(h) => h.server_version().await,
        }
    }

    /// End the scope. Closes a pooled connection; leaves SQLite open.
    pub async fn release(self) -> DbResult<()> {
        match self {
            Self::Pooled(c) => c.release().await,
            Self::Single(_) => Ok(()),
        }
    }
}
