//! Result handling at the end of a scoped acquisition.

use crate::error::DbResult;
use tracing::warn;

/// Combine the result of a scope body with the result of releasing its
/// connection.
///
/// A body error wins over a release error (the release error is logged).
/// A release error is returned when the body succeeded.
pub fn finish_scope<T>(body: DbResult<T>, release: DbResult<()>) -> DbResult<T> {
    match (body, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(body_err), Ok(())) => Err(body_err),
        (Err(body_err), Err(release_err)) => {
            warn!(
                error = %release_err,
                scope_error = %body_err,
                "Release failed after scope error"
            );
            Err(body_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;

    #[test]
    fn test_success_passes_value_through() {
        let result = finish_scope(Ok(42), Ok(()));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_release_error_surfaces_after_successful_body() {
        let result = finish_scope(Ok(42), Err(DbError::release("close failed")));
        assert!(matches!(result, Err(DbError::Release { .. })));
    }

    #[test]
    fn test_body_error_surfaces() {
        let result: DbResult<()> = finish_scope(Err(DbError::internal("boom")), Ok(()));
        assert!(matches!(result, Err(DbError::Internal { .. })));
    }

    #[test]
    fn test_body_error_wins_over_release_error() {
        let result: DbResult<()> = finish_scope(
            Err(DbError::database("syntax error", None, "check syntax")),
            Err(DbError::release("close failed")),
        );
        assert!(matches!(result, Err(DbError::Database { .. })));
    }
}
