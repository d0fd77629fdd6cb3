//! Backend dispatch macro.
//!
//! Expands to a `match` over the [`Backend`](crate::db::Backend) variants so
//! operations both backends share are written once.

/// Generate a match over `Backend` variants.
///
/// # Example
///
/// ```ignore
/// dispatch_backend!(self, {
///     Postgres(b) => b.release_policy(),
///     Sqlite(b) => b.release_policy(),
/// });
/// ```
#[macro_export]
macro_rules! dispatch_backend {
    ($backend:expr, { $($variant:ident($b:ident) => $body:expr),+ $(,)? }) => {
        match $backend {
            $(
                $crate::db::backend::Backend::$variant($b) => $body,
            )+
        }
    };
}

pub use dispatch_backend;
