//! Error types for the connection pool.

use thiserror::Error;

/// Boxed error type used at the adapter and connection boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the connection pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A connection could not be acquired from the pool engine.
    #[error("failed to acquire connection: {0}")]
    Acquire(#[from] PoolError),

    /// The connection reported a failure while executing a query.
    #[error("query failed: {0}")]
    Query(#[source] BoxError),

    /// The task driving a query ended without delivering a result.
    #[error("query ended before reaching a terminal state")]
    QueryAborted,

    /// The pool configuration is invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Returns `true` if this error came from acquiring a connection.
    #[must_use]
    pub fn is_acquire(&self) -> bool {
        matches!(self, Self::Acquire(_))
    }

    /// Returns `true` if the pool was closed or draining.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Acquire(PoolError::Draining))
    }
}

/// Errors raised by a pool engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool is draining or closed and accepts no new acquisitions.
    #[error("pool is draining and no longer accepts acquisitions")]
    Draining,

    /// A new resource could not be created.
    #[error("resource creation failed: {0}")]
    Create(#[source] BoxError),

    /// The engine went away while a caller was waiting for a resource.
    #[error("pool engine dropped a pending acquisition")]
    Dropped,
}

/// Errors raised while opening a connection inside the pool factory.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The adapter failed to open the connection.
    #[error("adapter failed to open connection: {0}")]
    Connect(#[source] BoxError),

    /// The post-connect hook rejected the new connection.
    #[error("post-connect hook failed: {0}")]
    OnConnect(#[source] BoxError),
}

/// A reset step failed; the connection is destroyed instead of reused.
#[derive(Debug, Error)]
#[error("reset step `{step}` failed: {source}")]
pub struct ResetError {
    /// Name of the step that failed.
    pub step: &'static str,
    /// Underlying failure.
    #[source]
    pub source: BoxError,
}
