//! Query binding with exactly-once release.
//!
//! Every query runs on its own task: acquire a connection, publish the
//! `query` event, execute, then hand the connection back exactly once.
//! The per-query state machine only moves forward
//! (`Pending -> Bound -> Completed`), and the transition to `Completed` is
//! what releases or destroys the connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll, ready};

use pin_project_lite::pin_project;
use tokio::sync::oneshot;

use crate::adapter::{Adapter, Connection, OutputOf, QueryOf};
use crate::error::{BoxError, Error, Result};
use crate::events::PoolEvent;
use crate::pool::ConnectionPool;
use crate::value::Value;

/// Lifecycle state of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QueryState {
    /// Waiting for a connection.
    Pending = 0,
    /// Bound to a connection and executing.
    Bound = 1,
    /// Terminal: the connection has been released or destroyed.
    Completed = 2,
}

impl QueryState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Bound,
            _ => Self::Completed,
        }
    }
}

/// Shared, forward-only query state.
#[derive(Debug, Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(QueryState::Pending as u8)))
    }

    fn get(&self) -> QueryState {
        QueryState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn advance(&self, to: QueryState) {
        self.0.fetch_max(to as u8, Ordering::AcqRel);
    }
}

/// Single-fire trigger guarding the release of a bound connection.
///
/// Any number of completion paths may call [`fire`](Self::fire); only the
/// first returns `true`.
#[derive(Debug, Default)]
pub struct ReleaseTrigger {
    fired: AtomicBool,
}

impl ReleaseTrigger {
    /// Create an unfired trigger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the trigger. Returns `true` only for the first call.
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    /// Whether the trigger has fired.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

pin_project! {
    /// Handle to a query issued through [`ConnectionPool::query`].
    ///
    /// Returned before the query is bound; await it for the terminal result.
    /// Dropping the handle does not cancel the query.
    #[must_use = "a query handle does nothing unless awaited or inspected"]
    pub struct QueryHandle<T> {
        statement: Arc<str>,
        state: StateCell,
        #[pin]
        result: oneshot::Receiver<Result<T>>,
    }
}

impl<T> QueryHandle<T> {
    /// The statement text this query was issued with.
    #[must_use]
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> QueryState {
        self.state.get()
    }
}

impl<T> Future for QueryHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match ready!(this.result.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(Error::QueryAborted)),
        }
    }
}

impl<T> std::fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("statement", &self.statement)
            .field("state", &self.state.get())
            .finish()
    }
}

/// A connection exclusively bound to one in-flight query.
///
/// Completing the query hands the connection back through the pool. If the
/// binding is dropped first (the query task unwound), the connection is
/// destroyed instead.
struct BoundQuery<A: Adapter> {
    pool: ConnectionPool<A>,
    conn: Option<A::Connection>,
    state: StateCell,
    trigger: ReleaseTrigger,
}

impl<A: Adapter> BoundQuery<A> {
    fn new(pool: ConnectionPool<A>, conn: A::Connection, state: StateCell) -> Self {
        state.advance(QueryState::Bound);
        Self {
            pool,
            conn: Some(conn),
            state,
            trigger: ReleaseTrigger::new(),
        }
    }

    async fn execute(&mut self, query: &mut QueryOf<A>) -> std::result::Result<OutputOf<A>, BoxError> {
        match self.conn.as_mut() {
            Some(conn) => conn.query(query).await,
            None => Err("query executed after its connection was released".into()),
        }
    }

    /// Move to `Completed`, yielding the connection on the first call only.
    fn take(&mut self) -> Option<A::Connection> {
        if !self.trigger.fire() {
            return None;
        }
        self.state.advance(QueryState::Completed);
        self.conn.take()
    }

    async fn complete(mut self, failed: bool) {
        let Some(conn) = self.take() else {
            return;
        };

        if failed && conn.is_broken() {
            tracing::debug!("destroying broken connection after query error");
            self.pool.destroy(conn).await;
        } else {
            self.pool.release(conn).await;
        }
    }
}

impl<A: Adapter> Drop for BoundQuery<A> {
    fn drop(&mut self) {
        let Some(conn) = self.take() else {
            return;
        };

        tracing::warn!("query ended without completing, destroying its connection");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = self.pool.clone();
                runtime.spawn(async move { pool.destroy(conn).await });
            }
            Err(_) => {
                tracing::warn!("no runtime available, connection dropped without teardown");
            }
        }
    }
}

/// Build the query through the adapter and drive it on a new task.
///
/// `finish` maps the terminal result to what the handle yields; it runs after
/// the connection has been released.
pub(crate) fn spawn<A, T, F>(
    pool: ConnectionPool<A>,
    statement: &str,
    params: Vec<Value>,
    finish: F,
) -> QueryHandle<T>
where
    A: Adapter,
    T: Send + 'static,
    F: FnOnce(Result<OutputOf<A>>) -> Result<T> + Send + 'static,
{
    let query = pool.adapter().create_query(statement, &params);
    let statement: Arc<str> = Arc::from(statement);
    let state = StateCell::new();
    let (tx, rx) = oneshot::channel();

    let handle = QueryHandle {
        statement: Arc::clone(&statement),
        state: state.clone(),
        result: rx,
    };

    tokio::spawn(async move {
        let result = run(pool, &statement, params, query, state).await;
        let _ = tx.send(finish(result));
    });

    handle
}

async fn run<A: Adapter>(
    pool: ConnectionPool<A>,
    statement: &str,
    params: Vec<Value>,
    mut query: QueryOf<A>,
    state: StateCell,
) -> Result<OutputOf<A>> {
    let conn = pool.acquire().await?;

    pool.emit(&PoolEvent::Query {
        statement: statement.to_string(),
        params,
    });

    let mut bound = BoundQuery::new(pool.clone(), conn, state);
    let result = bound.execute(&mut query).await;
    bound.complete(result.is_err()).await;

    pool.record_query(result.is_ok());
    result.map_err(|e| {
        tracing::debug!(statement, error = %e, "query failed");
        Error::Query(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_fires_once() {
        let trigger = ReleaseTrigger::new();
        assert!(!trigger.has_fired());
        assert!(trigger.fire());
        assert!(!trigger.fire());
        assert!(!trigger.fire());
        assert!(trigger.has_fired());
    }

    #[test]
    fn test_trigger_fires_once_across_threads() {
        let trigger = Arc::new(ReleaseTrigger::new());
        let wins: usize = (0..8)
            .map(|_| {
                let trigger = Arc::clone(&trigger);
                std::thread::spawn(move || trigger.fire())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_state_only_moves_forward() {
        let state = StateCell::new();
        assert_eq!(state.get(), QueryState::Pending);

        state.advance(QueryState::Completed);
        state.advance(QueryState::Bound);
        assert_eq!(state.get(), QueryState::Completed);
    }

    #[tokio::test]
    async fn test_handle_resolves_aborted_when_task_dies() {
        let (tx, rx) = oneshot::channel::<Result<u32>>();
        let handle = QueryHandle {
            statement: Arc::from("SELECT 1"),
            state: StateCell::new(),
            result: rx,
        };
        assert_eq!(handle.statement(), "SELECT 1");
        assert_eq!(handle.state(), QueryState::Pending);

        drop(tx);
        assert!(matches!(handle.await, Err(Error::QueryAborted)));
    }

    #[tokio::test]
    async fn test_handle_yields_delivered_result() {
        let (tx, rx) = oneshot::channel();
        let handle = QueryHandle {
            statement: Arc::from("SELECT 1"),
            state: StateCell::new(),
            result: rx,
        };

        tx.send(Ok(7_u32)).unwrap();
        assert_eq!(handle.await.unwrap(), 7);
    }
}
