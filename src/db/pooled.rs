//! Pooled PostgreSQL backend.
//!
//! Every scoped acquisition checks one connection out of a `PgPool` and
//! closes that connection when the scope ends. By default the pool itself is
//! built fresh for each acquisition and closed together with the connection
//! ([`PoolReuse::PerCall`]); [`PoolReuse::Shared`] keeps one pool for the
//! lifetime of the backend instead.
//!
//! # Release guarantees
//!
//! - [`PooledConnection::release`] closes the connection and reports a close
//!   failure as [`DbError::Release`].
//! - Dropping the guard without releasing it (early return, panic, cancelled
//!   future) schedules the same close on the tokio runtime.
//! - The connection is closed exactly once on either path.
//!
//! The close path is generic over the sqlx database and is unit tested here
//! against SQLite pools. End-to-end PostgreSQL tests live in
//! `tests/pooled_backend_test.rs` and only run when `TEST_POSTGRES_URL` is set.

use crate::config::{PoolReuse, PostgresConfig};
use crate::db::checkout::checkout;
use crate::db::scope::finish_scope;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, HandleInfo, ReleasePolicy};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Database, Pool, Postgres};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded PostgreSQL pool, `[2, max(pool_size, 2)]` connections.
pub type ConnectionPool = PgPool;

/// Connection provider backed by a bounded PostgreSQL pool.
pub struct PooledBackend {
    config: PostgresConfig,
    /// Only populated under `PoolReuse::Shared`.
    shared: RwLock<Option<PgPool>>,
    /// Count of checked-out, unreleased guards.
    active: Arc<AtomicUsize>,
}

impl PooledBackend {
    /// Create a backend from validated settings. No connection is opened.
    pub fn new(config: PostgresConfig) -> DbResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shared: RwLock::new(None),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    pub fn db_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        ReleasePolicy::CloseOnExit
    }

    /// Pool sizing: at least two connections, at most `max(pool_size, 2)`.
    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .min_connections(self.config.min_connections())
            .max_connections(self.config.max_connections())
            .acquire_timeout(self.config.acquire_timeout())
    }

    /// Build a brand-new pool from the stored configuration.
    ///
    /// Nothing is cached here; callers own the returned pool.
    pub async fn build_pool(&self) -> DbResult<ConnectionPool> {
        info!(
            url = %self.config.masked_url(),
            min_connections = self.config.min_connections(),
            max_connections = self.config.max_connections(),
            "Building connection pool"
        );

        let pool = self
            .pool_options()
            .connect_with(self.config.connect_options())
            .await
            .map_err(|e| {
                DbError::connection(
                    format!("Failed to connect to {}: {}", self.config.masked_url(), e),
                    connection_suggestion(&e),
                )
            })?;

        debug!(size = pool.size(), "Connection pool ready");
        Ok(pool)
    }

    /// Get the shared pool, building it on first use.
    async fn shared_pool(&self) -> DbResult<PgPool> {
        {
            let shared = self.shared.read().await;
            if let Some(pool) = shared.as_ref() {
                return Ok(pool.clone());
            }
        }

        // Held across the build so concurrent first uses create one pool.
        let mut shared = self.shared.write().await;
        if let Some(pool) = shared.as_ref() {
            return Ok(pool.clone());
        }
        let pool = self.build_pool().await?;
        *shared = Some(pool.clone());
        Ok(pool)
    }

    /// Check out one connection for the caller's scope.
    ///
    /// The returned guard closes the connection on `release()` or on drop.
    pub async fn scoped_connection(&self) -> DbResult<PooledConnection> {
        let (pool, owned) = match self.config.pool_reuse {
            PoolReuse::PerCall => (self.build_pool().await?, true),
            PoolReuse::Shared => (self.shared_pool().await?, false),
        };

        let conn = match checkout(&pool, self.config.checkout).await {
            Ok(conn) => conn,
            Err(e) => {
                if owned {
                    pool.close().await;
                }
                return Err(e);
            }
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = PooledConnection {
            info: HandleInfo::new(DatabaseType::PostgreSQL, ReleasePolicy::CloseOnExit),
            conn: Some(conn),
            owned_pool: owned.then_some(pool),
            active: Arc::clone(&self.active),
            released: false,
        };

        debug!(
            handle_id = %guard.info.id,
            pool_reuse = ?self.config.pool_reuse,
            active_count = self.active_count(),
            "Checked out connection"
        );
        Ok(guard)
    }

    /// Run `f` with a checked-out connection, then close that connection.
    ///
    /// If `f` fails its error is returned even when closing also failed;
    /// if only closing failed, the [`DbError::Release`] is returned.
    pub async fn with_connection<F, T>(&self, f: F) -> DbResult<T>
    where
        F: AsyncFnOnce(&mut PgConnection) -> DbResult<T>,
    {
        let mut scoped = self.scoped_connection().await?;
        let body = match scoped.connection() {
            Ok(conn) => f(conn).await,
            Err(e) => Err(e),
        };
        let release = scoped.release().await;
        finish_scope(body, release)
    }

    /// Number of connections currently checked out through this backend.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Whether a shared pool is currently alive.
    pub async fn has_shared_pool(&self) -> bool {
        self.shared.read().await.is_some()
    }

    /// Tear down the shared pool, if any. Safe to call repeatedly.
    ///
    /// A later acquisition under `PoolReuse::Shared` builds a new pool.
    pub async fn close(&self) {
        let pool = self.shared.write().await.take();
        if let Some(pool) = pool {
            info!(url = %self.config.masked_url(), "Closing shared connection pool");
            pool.close().await;
        }
    }
}

impl std::fmt::Debug for PooledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBackend")
            .field("config", &self.config)
            .field("active_count", &self.active_count())
            .finish_non_exhaustive()
    }
}

/// A checked-out PostgreSQL connection, closed when its scope ends.
///
/// # Usage
///
/// ```ignore
/// let mut conn = backend.scoped_connection().await?;
/// let version = conn.server_version().await;
/// // Explicit release (preferred) or rely on Drop
/// conn.release().await?;
/// ```
pub struct PooledConnection {
    info: HandleInfo,
    conn: Option<PoolConnection<Postgres>>,
    /// The per-call pool this connection came from, closed on release.
    owned_pool: Option<PgPool>,
    active: Arc<AtomicUsize>,
    released: bool,
}

impl PooledConnection {
    pub fn info(&self) -> &HandleInfo {
        &self.info
    }

    pub fn id(&self) -> Uuid {
        self.info.id
    }

    /// The per-call pool owned by this guard (`None` under shared reuse).
    pub fn owned_pool(&self) -> Option<&PgPool> {
        self.owned_pool.as_ref()
    }

    /// Borrow the live connection.
    pub fn connection(&mut self) -> DbResult<&mut PgConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| DbError::internal("Connection already released"))
    }

    /// Ask the server for its version string.
    pub async fn server_version(&mut self) -> DbResult<String> {
        let conn = self.connection()?;
        let version = sqlx::query_scalar::<_, String>("SELECT version()")
            .fetch_one(conn)
            .await?;
        Ok(version)
    }

    /// Close the connection (and its per-call pool).
    pub async fn release(mut self) -> DbResult<()> {
        self.released = true;
        let conn = self.conn.take();
        let pool = self.owned_pool.take();
        decrement_active(&self.active);
        close_checkout(self.info.id, conn, pool).await
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.info.id)
            .field("opened_at", &self.info.opened_at)
            .field("owns_pool", &self.owned_pool.is_some())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        decrement_active(&self.active);

        schedule_close(self.info.id, self.conn.take(), self.owned_pool.take());
    }
}

/// Close a checked-out connection, then the pool it came from if owned.
async fn close_checkout<DB: Database>(
    id: Uuid,
    conn: Option<PoolConnection<DB>>,
    pool: Option<Pool<DB>>,
) -> DbResult<()> {
    let result = match conn {
        Some(conn) => conn
            .close()
            .await
            .map_err(|e| DbError::release(format!("Failed to close connection {}: {}", id, e))),
        None => Ok(()),
    };

    if let Some(pool) = pool {
        pool.close().await;
    }

    debug!(handle_id = %id, ok = result.is_ok(), "Released connection");
    result
}

/// Run `close_checkout` on the tokio runtime; used from `Drop`.
fn schedule_close<DB: Database>(
    id: Uuid,
    conn: Option<PoolConnection<DB>>,
    pool: Option<Pool<DB>>,
) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                match close_checkout(id, conn, pool).await {
                    Ok(()) => warn!(
                        handle_id = %id,
                        "Connection released via Drop - consider using explicit release()"
                    ),
                    Err(e) => warn!(
                        handle_id = %id,
                        error = %e,
                        "Failed to close connection released via Drop"
                    ),
                }
            });
        }
        Err(_) => warn!(
            handle_id = %id,
            "No async runtime available; connection dropped without close"
        ),
    }
}

/// Saturates at 0 so an extra release cannot wrap the counter.
fn decrement_active(active: &AtomicUsize) {
    let result = active.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
        Some(count.saturating_sub(1))
    });

    if let Ok(0) = result {
        warn!("Active count underflow detected - extra release call");
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if matches!(error, sqlx::Error::PoolTimedOut) || error_str.contains("connection refused") {
        return "Check that the PostgreSQL server is running and accessible".to_string();
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the user and password".to_string();
    }

    if error_str.contains("does not exist") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    "Verify host, port, user, password and database name".to_string()
}
