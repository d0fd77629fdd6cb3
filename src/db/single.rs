//! Single-connection SQLite backend.
//!
//! At most one connection is cached per backend. It is opened lazily on the
//! first `connect()` (or scoped acquisition) and stays open until `close()`;
//! ending a scope does not release it.

use crate::config::SqliteConfig;
use crate::db::scope::finish_scope;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, HandleInfo, ReleasePolicy};
use sqlx::sqlite::SqliteConnection;
use sqlx::{ConnectOptions, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Connection provider that caches one SQLite connection.
pub struct SingleConnectionBackend {
    config: SqliteConfig,
    /// Guards creation and teardown of the cached handle.
    handle: Mutex<Option<SqliteHandle>>,
}

impl SingleConnectionBackend {
    /// Create an unconnected backend. The database file is not touched.
    pub fn new(config: SqliteConfig) -> DbResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    pub fn db_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        ReleasePolicy::KeepOpen
    }

    /// Return the cached handle, opening the connection if there is none.
    ///
    /// Concurrent callers share one connection.
    pub async fn connect(&self) -> DbResult<SqliteHandle> {
        let mut cached = self.handle.lock().await;
        if let Some(handle) = cached.as_ref() {
            return Ok(handle.clone());
        }

        let path = self.config.path.display().to_string();
        let conn = self
            .config
            .connect_options()?
            .connect()
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to open SQLite database '{}': {}", path, e),
                    open_suggestion(&self.config),
                )
            })?;

        let handle = SqliteHandle::new(conn);
        info!(
            handle_id = %handle.id(),
            path = %path,
            read_only = self.config.read_only,
            "Opened SQLite connection"
        );
        *cached = Some(handle.clone());
        Ok(handle)
    }

    /// Close and forget the cached connection. No-op when unconnected.
    ///
    /// The next `connect()` opens a new connection.
    pub async fn close(&self) -> DbResult<()> {
        let mut cached = self.handle.lock().await;
        if let Some(handle) = cached.as_ref().filter(|h| h.in_use_by_current_task()) {
            return Err(reentrant_use(handle.id()));
        }
        let Some(handle) = cached.take() else {
            debug!("close() on unconnected SQLite backend");
            return Ok(());
        };

        let id = handle.id();
        handle.shutdown().await?;
        info!(handle_id = %id, "Closed SQLite connection");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Yield the cached handle for a scope. Leaving the scope keeps it open.
    pub async fn scoped_connection(&self) -> DbResult<SqliteHandle> {
        self.connect().await
    }

    /// Run `f` on the cached connection, which stays open afterwards.
    ///
    /// See [`SqliteHandle::with_connection`] for what `f` may not do.
    pub async fn with_connection<F, T>(&self, f: F) -> DbResult<T>
    where
        F: AsyncFnOnce(&mut SqliteConnection) -> DbResult<T>,
    {
        let handle = self.scoped_connection().await?;
        let body = handle.with_connection(f).await;
        // Scope exit releases nothing for this backend.
        finish_scope(body, Ok(()))
    }
}

impl std::fmt::Debug for SingleConnectionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleConnectionBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn open_suggestion(config: &SqliteConfig) -> String {
    if config.read_only || !config.create_if_missing {
        "Check that the database file exists and is readable".to_string()
    } else {
        "Check that the parent directory exists and is writable".to_string()
    }
}

tokio::task_local! {
    /// Handles whose connection the current task is inside `with_connection` for.
    static IN_USE: Vec<Uuid>;
}

fn reentrant_use(id: Uuid) -> DbError {
    DbError::internal(format!(
        "SQLite connection {} is already in use by this task",
        id
    ))
}

struct HandleInner {
    info: HandleInfo,
    conn: Mutex<Option<SqliteConnection>>,
}

/// Shared reference to the cached SQLite connection.
///
/// Clones refer to the same connection. Once the backend closes it, every
/// clone reports `is_open() == false`.
#[derive(Clone)]
pub struct SqliteHandle {
    inner: Arc<HandleInner>,
}

impl SqliteHandle {
    fn new(conn: SqliteConnection) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                info: HandleInfo::new(DatabaseType::SQLite, ReleasePolicy::KeepOpen),
                conn: Mutex::new(Some(conn)),
            }),
        }
    }

    pub fn info(&self) -> &HandleInfo {
        &self.inner.info
    }

    pub fn id(&self) -> Uuid {
        self.inner.info.id
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same_connection(&self, other: &SqliteHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn is_open(&self) -> bool {
        // Inside our own `with_connection` the lock is held and the connection is live
        if self.in_use_by_current_task() {
            return true;
        }
        self.inner.conn.lock().await.is_some()
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// The connection stays locked while `f` runs. Using this handle again
    /// from inside `f` (`server_version()`, a nested `with_connection`, or the
    /// backend's `close()`) returns [`DbError::Internal`] instead of waiting
    /// on itself. Work spawned onto another task from `f` and awaited there
    /// cannot be detected and will block until `f` returns.
    pub async fn with_connection<F, T>(&self, f: F) -> DbResult<T>
    where
        F: AsyncFnOnce(&mut SqliteConnection) -> DbResult<T>,
    {
        if self.in_use_by_current_task() {
            return Err(reentrant_use(self.id()));
        }

        let mut guard = self.inner.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| {
            DbError::connection(
                format!("SQLite connection {} has been closed", self.id()),
                "Call connect() again to open a new connection",
            )
        })?;

        let mut in_use = IN_USE.try_with(|ids| ids.clone()).unwrap_or_default();
        in_use.push(self.id());
        IN_USE.scope(in_use, f(conn)).await
    }

    fn in_use_by_current_task(&self) -> bool {
        IN_USE
            .try_with(|ids| ids.contains(&self.id()))
            .unwrap_or(false)
    }

    /// Ask SQLite for its library version.
    pub async fn server_version(&self) -> DbResult<String> {
        self.with_connection(async |conn| {
            let version = sqlx::query_scalar::<_, String>("SELECT sqlite_version()")
                .fetch_one(conn)
                .await?;
            Ok(version)
        })
        .await
    }

    async fn shutdown(&self) -> DbResult<()> {
        let conn = self.inner.conn.lock().await.take();
        match conn {
            Some(conn) => conn.close().await.map_err(|e| {
                DbError::release(format!(
                    "Failed to close SQLite connection {}: {}",
                    self.id(),
                    e
                ))
            }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SqliteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHandle")
            .field("id", &self.inner.info.id)
            .field("opened_at", &self.inner.info.opened_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_backend() -> SingleConnectionBackend {
        SingleConnectionBackend::new(SqliteConfig::new(":memory:")).unwrap()
    }

    #[tokio::test]
    async fn test_connect_is_lazy_and_cached() {
        let backend = memory_backend();
        assert!(!backend.is_connected().await);

        let a = backend.connect().await.unwrap();
        let b = backend.connect().await.unwrap();
        assert!(backend.is_connected().await);
        assert!(a.same_connection(&b));
        assert_eq!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_close_then_connect_opens_new_connection() {
        let backend = memory_backend();
        let first = backend.connect().await.unwrap();
        backend.close().await.unwrap();

        assert!(!backend.is_connected().await);
        assert!(!first.is_open().await);

        let second = backend.connect().await.unwrap();
        assert!(!first.same_connection(&second));
        assert!(second.is_open().await);
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let backend = memory_backend();
        backend.close().await.unwrap();
        backend.close().await.unwrap();
        assert!(!backend.is_connected().await);
    }

    #[tokio::test]
    async fn test_closed_handle_refuses_use() {
        let backend = memory_backend();
        let handle = backend.connect().await.unwrap();
        backend.close().await.unwrap();

        let err = handle.server_version().await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_scope_exit_keeps_connection_open() {
        let backend = memory_backend();
        let n: i64 = backend
            .with_connection(async |conn| {
                let n = sqlx::query_scalar::<_, i64>("SELECT 1")
                    .fetch_one(conn)
                    .await?;
                Ok(n)
            })
            .await
            .unwrap();
        assert_eq!(n, 1);

        let handle = backend.scoped_connection().await.unwrap();
        assert!(handle.is_open().await);
        assert!(backend.is_connected().await);
    }

    #[tokio::test]
    async fn test_nested_use_inside_with_connection_fails() {
        let backend = memory_backend();
        let handle = backend.connect().await.unwrap();
        let inner = handle.clone();

        let err = handle
            .with_connection(async |_conn| inner.server_version().await)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));
        assert!(err.to_string().contains("already in use"));

        let open = handle
            .with_connection(async |_conn| Ok::<_, DbError>(inner.is_open().await))
            .await
            .unwrap();
        assert!(open);

        // The lock was released once the outer scope ended
        assert!(handle.server_version().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_inside_with_connection_fails() {
        let backend = memory_backend();
        let err = backend
            .with_connection(async |_conn| backend.close().await)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal { .. }));

        assert!(backend.is_connected().await);
        backend.close().await.unwrap();
        assert!(!backend.is_connected().await);
    }

    #[tokio::test]
    async fn test_other_handle_usable_inside_with_connection() {
        let first = memory_backend();
        let second = memory_backend();
        let other = second.connect().await.unwrap();

        let version = first
            .with_connection(async |_conn| other.server_version().await)
            .await
            .unwrap();
        assert!(version.starts_with('3'));
    }

    #[tokio::test]
    async fn test_server_version() {
        let backend = memory_backend();
        let handle = backend.scoped_connection().await.unwrap();
        let version = handle.server_version().await.unwrap();
        assert!(version.starts_with('3'));
    }

    #[test]
    fn test_release_policy() {
        let backend = memory_backend();
        assert_eq!(backend.release_policy(), ReleasePolicy::KeepOpen);
        assert_eq!(backend.db_type(), DatabaseType::SQLite);
    }

    #[test]
    fn test_new_rejects_empty_path() {
        let result = SingleConnectionBackend::new(SqliteConfig::new(""));
        assert!(matches!(result, Err(DbError::Configuration { .. })));
    }
}
