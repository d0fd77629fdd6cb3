//! Connection providers.
//!
//! - `pooled`: PostgreSQL, one connection checked out per scope and closed
//!   when the scope ends
//! - `single`: SQLite, one cached connection kept open across scopes
//! - `backend`: an enum over both for callers that pick the backend at runtime

pub mod backend;
pub mod checkout;
#[macro_use]
pub mod macros;
pub mod pooled;
pub mod scope;
pub mod single;

pub use backend::{Backend, ScopedConnection};
pub use checkout::checkout;
pub use pooled::{ConnectionPool, PooledBackend, PooledConnection};
pub use scope::finish_scope;
pub use single::{SingleConnectionBackend, SqliteHandle};
