//! Checking a single connection out of a driver pool.
//!
//! Generic over the sqlx database so the exhaustion policy can be exercised
//! against any bounded pool.

use crate::config::CheckoutPolicy;
use crate::error::{DbError, DbResult};
use sqlx::pool::PoolConnection;
use sqlx::{Database, Pool};
use std::time::Duration;
use tracing::debug;

/// Upper bound on opening a new connection under `FailFast`.
///
/// Another checkout can take the last slot between the size check and the
/// open, leaving the open waiting for a release instead.
pub const FAIL_FAST_OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Check out one connection from `pool`.
///
/// With [`CheckoutPolicy::Wait`] the call waits up to the pool's acquire
/// timeout for a connection to come back. With [`CheckoutPolicy::FailFast`]
/// it fails immediately once every connection the pool may open is in use.
/// Either way an exhausted pool surfaces as [`DbError::Connection`].
pub async fn checkout<DB: Database>(
    pool: &Pool<DB>,
    policy: CheckoutPolicy,
) -> DbResult<PoolConnection<DB>> {
    let max_connections = pool.options().get_max_connections();

    match policy {
        CheckoutPolicy::Wait => pool
            .acquire()
            .await
            .map_err(|e| checkout_error(e, max_connections)),
        CheckoutPolicy::FailFast => {
            if let Some(conn) = pool.try_acquire() {
                return Ok(conn);
            }
            // No idle connection; open a new one only if the pool has room.
            if pool.size() < max_connections {
                let limit = FAIL_FAST_OPEN_TIMEOUT.min(pool.options().get_acquire_timeout());
                return match tokio::time::timeout(limit, pool.acquire()).await {
                    Ok(result) => result.map_err(|e| checkout_error(e, max_connections)),
                    Err(_) if pool.size() >= max_connections => {
                        debug!(max_connections, "Lost the last slot to a concurrent checkout");
                        Err(exhausted(max_connections))
                    }
                    Err(_) => Err(DbError::connection(
                        format!("Timed out after {:?} opening a new connection", limit),
                        "Check that the database server is running and accessible",
                    )),
                };
            }
            debug!(
                max_connections = max_connections,
                "Pool exhausted, failing checkout"
            );
            Err(exhausted(max_connections))
        }
    }
}

fn exhausted(max_connections: u32) -> DbError {
    DbError::connection(
        format!(
            "Connection pool exhausted: all {} connections are checked out",
            max_connections
        ),
        "Increase pool_size or release connections sooner",
    )
}

fn checkout_error(err: sqlx::Error, max_connections: u32) -> DbError {
    match err {
        sqlx::Error::PoolTimedOut => DbError::connection(
            format!(
                "Connection pool exhausted: no connection became available within the acquire timeout (max {} connections)",
                max_connections
            ),
            "Increase pool_size or acquire_timeout, or release connections sooner",
        ),
        other => DbError::connection(
            format!("Failed to check out a connection: {}", other),
            "Check that the database server is running and accessible",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::{Duration, Instant};

    async fn memory_pool(max_connections: u32, acquire_timeout: Duration) -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_checkout_up_to_max_connections() {
        let pool = memory_pool(3, Duration::from_secs(5)).await;

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(checkout(&pool, CheckoutPolicy::FailFast).await.unwrap());
        }
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn test_wait_policy_times_out_when_exhausted() {
        let pool = memory_pool(2, Duration::from_millis(200)).await;
        let _a = checkout(&pool, CheckoutPolicy::Wait).await.unwrap();
        let _b = checkout(&pool, CheckoutPolicy::Wait).await.unwrap();

        let start = Instant::now();
        let err = checkout(&pool, CheckoutPolicy::Wait).await.unwrap_err();

        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.to_string().contains("exhausted"));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_fail_fast_policy_does_not_wait() {
        let pool = memory_pool(2, Duration::from_secs(10)).await;
        let _a = checkout(&pool, CheckoutPolicy::FailFast).await.unwrap();
        let _b = checkout(&pool, CheckoutPolicy::FailFast).await.unwrap();

        let start = Instant::now();
        let err = checkout(&pool, CheckoutPolicy::FailFast).await.unwrap_err();

        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.to_string().contains("exhausted"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_concurrent_fail_fast_checkouts_do_not_wait() {
        let pool = memory_pool(2, Duration::from_secs(30)).await;

        let start = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                checkout(&pool, CheckoutPolicy::FailFast).await
            }));
        }

        let mut held = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok(conn) => held.push(conn),
                Err(e) => assert!(e.to_string().contains("exhausted"), "unexpected: {e}"),
            }
        }

        assert!(start.elapsed() < FAIL_FAST_OPEN_TIMEOUT + Duration::from_secs(2));
        assert!(!held.is_empty());
        assert!(held.len() <= 2);
    }

    #[tokio::test]
    async fn test_wait_policy_unblocks_when_connection_returns() {
        let pool = memory_pool(1, Duration::from_secs(5)).await;
        let held = checkout(&pool, CheckoutPolicy::Wait).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { checkout(&pool, CheckoutPolicy::Wait).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_checkout_from_closed_pool() {
        let pool = memory_pool(2, Duration::from_secs(1)).await;
        pool.close().await;

        let err = checkout(&pool, CheckoutPolicy::Wait).await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }
}
