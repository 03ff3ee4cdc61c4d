//! Backend adapter and connection traits.
//!
//! The pool knows nothing about wire protocols. An [`Adapter`] opens
//! connections and builds query objects; a [`Connection`] executes them and
//! tears itself down. Everything else (acquisition, reset, release, destroy)
//! is owned by the pool.

use async_trait::async_trait;

use crate::error::BoxError;
use crate::value::Value;

/// A live, poolable connection produced by an [`Adapter`].
#[async_trait]
pub trait Connection: Send + 'static {
    /// Query object type executed by this connection.
    type Query: Send + 'static;

    /// Result produced by a successfully executed query.
    type Output: Send + 'static;

    /// Execute a query, resolving once it reaches its terminal state.
    async fn query(&mut self, query: &mut Self::Query) -> Result<Self::Output, BoxError>;

    /// Tear down the underlying connection.
    async fn end(&mut self) -> Result<(), BoxError>;

    /// Drop every observer attached to this connection by queries or by the
    /// adapter, so nothing fires against a later, unrelated checkout.
    fn detach_all_observers(&mut self);

    /// Whether the connection is known to be unusable.
    ///
    /// Checked after a query error; a broken connection is destroyed rather
    /// than reset and returned to the pool.
    fn is_broken(&self) -> bool {
        false
    }
}

/// Backend-specific factory for connections and query objects.
///
/// # Example
///
/// ```rust,ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Adapter for Echo {
///     type Config = String;
///     type Connection = EchoConnection;
///
///     async fn create_connection(&self, addr: &String) -> Result<EchoConnection, BoxError> {
///         EchoConnection::open(addr).await
///     }
///
///     fn create_query(&self, statement: &str, params: &[Value]) -> EchoQuery {
///         EchoQuery::new(statement, params)
///     }
/// }
/// ```
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Parameters needed to open a connection (address, credentials, ...).
    type Config: Send + Sync + 'static;

    /// Connection type produced by this adapter.
    type Connection: Connection;

    /// Open a new connection.
    async fn create_connection(
        &self,
        config: &Self::Config,
    ) -> Result<Self::Connection, BoxError>;

    /// Build a query object for a statement and its parameters.
    fn create_query(
        &self,
        statement: &str,
        params: &[Value],
    ) -> <Self::Connection as Connection>::Query;

    /// Adapter-level reset, run first in the reset pipeline.
    ///
    /// The default does nothing, which is equivalent to the adapter not
    /// declaring a reset step.
    async fn reset(&self, _connection: &mut Self::Connection) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Query object type of an adapter's connections.
pub type QueryOf<A> = <<A as Adapter>::Connection as Connection>::Query;

/// Query output type of an adapter's connections.
pub type OutputOf<A> = <<A as Adapter>::Connection as Connection>::Output;
