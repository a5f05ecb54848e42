use std::io;

use thiserror::Error;

/// Errors returned to callers of the pool.
///
/// Health-probe failures never surface here: a failed candidate is purged and
/// the search moves on.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `max_connections` reached and no idle connection survived validation.
    #[error("connection pool exhausted")]
    Exhausted,

    /// The backend could not be reached.
    #[error("dial failed: {0}")]
    Dial(#[source] io::Error),
}
