//! # adapter-pool-testing
//!
//! Test infrastructure for `adapter-pool`.
//!
//! [`MockAdapter`] produces in-memory connections whose behaviour can be
//! scripted at runtime (refuse connections, fail resets or queries, mark
//! connections broken, hold queries behind a gate) and records every
//! operation it performs. [`EventRecorder`] captures the pool's lifecycle
//! events in delivery order.
//!
//! ## Example
//!
//! ```rust,ignore
//! use adapter_pool_testing::{EventRecorder, MockAdapter, mock_pool};
//!
//! let adapter = MockAdapter::new();
//! let pool = mock_pool(&adapter, PoolConfig::new().max_connections(1)).await;
//! let events = EventRecorder::attach(&pool);
//!
//! pool.query("SELECT 1", vec![]).await?;
//! assert_eq!(adapter.connections_created(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use adapter_pool::{
    Adapter, BoxError, Connection, ConnectionPool, EventKind, PoolConfig, PoolEvent, Value,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Statement that makes a mock connection panic mid-query.
pub const PANIC_STATEMENT: &str = "__panic__";

/// Errors produced by the mock backend.
#[derive(Debug, Error)]
pub enum MockError {
    /// The mock server refused the connection.
    #[error("connection refused by mock server")]
    ConnectionRefused,

    /// The mock server rejected a query.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The adapter reset step failed.
    #[error("reset failed on connection {0}")]
    ResetFailed(u64),

    /// The query gate was closed.
    #[error("query gate closed")]
    GateClosed,
}

/// An operation performed by the mock backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    /// A connection was opened.
    Connect(u64),
    /// The adapter built a query object.
    CreateQuery(String),
    /// A query ran on a connection.
    Query {
        /// Connection that executed the query.
        connection: u64,
        /// Statement text.
        statement: String,
    },
    /// The adapter reset a connection.
    Reset(u64),
    /// A connection was ended.
    End(u64),
    /// A connection's observers were detached.
    Detach(u64),
}

#[derive(Default)]
struct MockState {
    next_id: AtomicU64,
    refuse_connections: AtomicBool,
    fail_resets: AtomicBool,
    fail_queries: AtomicBool,
    break_on_error: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    ops: Mutex<Vec<MockOp>>,
}

impl MockState {
    fn record(&self, op: MockOp) {
        tracing::trace!(?op, "mock operation");
        self.ops.lock().push(op);
    }
}

/// Scriptable in-memory adapter.
///
/// Clones share state, so a test can keep one clone for scripting and
/// inspection after handing another to the pool.
#[derive(Clone, Default)]
pub struct MockAdapter {
    state: Arc<MockState>,
}

impl MockAdapter {
    /// Create an adapter that succeeds at everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make the adapter's reset step fail.
    pub fn fail_resets(&self, fail: bool) {
        self.state.fail_resets.store(fail, Ordering::SeqCst);
    }

    /// Make every query fail.
    pub fn fail_queries(&self, fail: bool) {
        self.state.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Mark connections broken when a query fails on them.
    pub fn break_on_error(&self, enabled: bool) {
        self.state.break_on_error.store(enabled, Ordering::SeqCst);
    }

    /// Hold every query until [`open_gate`](Self::open_gate) lets it through.
    pub fn close_gate(&self) {
        *self.state.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `queries` held queries proceed.
    pub fn open_gate(&self, queries: usize) {
        if let Some(gate) = self.state.gate.lock().as_ref() {
            gate.add_permits(queries);
        }
    }

    /// Every operation performed so far, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<MockOp> {
        self.state.ops.lock().clone()
    }

    /// Operations performed on one connection, in order.
    #[must_use]
    pub fn ops_for(&self, connection: u64) -> Vec<MockOp> {
        self.ops()
            .into_iter()
            .filter(|op| match op {
                MockOp::Connect(id)
                | MockOp::Reset(id)
                | MockOp::End(id)
                | MockOp::Detach(id) => *id == connection,
                MockOp::Query { connection: id, .. } => *id == connection,
                MockOp::CreateQuery(_) => false,
            })
            .collect()
    }

    /// Number of connections opened.
    #[must_use]
    pub fn connections_created(&self) -> usize {
        self.count(|op| matches!(op, MockOp::Connect(_)))
    }

    /// Number of connections ended.
    #[must_use]
    pub fn connections_ended(&self) -> usize {
        self.count(|op| matches!(op, MockOp::End(_)))
    }

    /// Number of queries executed on a connection.
    #[must_use]
    pub fn queries_executed(&self) -> usize {
        self.count(|op| matches!(op, MockOp::Query { .. }))
    }

    /// Number of adapter resets performed.
    #[must_use]
    pub fn resets(&self) -> usize {
        self.count(|op| matches!(op, MockOp::Reset(_)))
    }

    fn count(&self, predicate: impl Fn(&MockOp) -> bool) -> usize {
        self.state.ops.lock().iter().filter(|op| predicate(op)).count()
    }
}

impl std::fmt::Debug for MockAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAdapter")
            .field("ops", &self.state.ops.lock().len())
            .finish_non_exhaustive()
    }
}

/// Query object built by [`MockAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockQuery {
    /// Statement text.
    pub statement: String,
    /// Bound parameters.
    pub params: Vec<Value>,
}

/// Result of a successful mock query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRows {
    /// Connection that served the query.
    pub connection_id: u64,
    /// Statement text.
    pub statement: String,
    /// Number of parameters received.
    pub param_count: usize,
}

/// In-memory connection produced by [`MockAdapter`].
pub struct MockConnection {
    id: u64,
    state: Arc<MockState>,
    observers: usize,
    broken: bool,
}

impl MockConnection {
    /// Connection identifier, unique per adapter.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Observers attached by queries since the last detach.
    #[must_use]
    pub fn observers(&self) -> usize {
        self.observers
    }

    #[allow(clippy::panic)]
    fn panic_mid_query(&self) -> ! {
        panic!("mock connection {} panicked mid-query", self.id)
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("observers", &self.observers)
            .field("broken", &self.broken)
            .finish()
    }
}

#[async_trait]
impl Connection for MockConnection {
    type Query = MockQuery;
    type Output = MockRows;

    async fn query(&mut self, query: &mut MockQuery) -> Result<MockRows, BoxError> {
        self.observers += 1;

        let gate = self.state.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await.map_err(|_| MockError::GateClosed)?.forget();
        }

        self.state.record(MockOp::Query {
            connection: self.id,
            statement: query.statement.clone(),
        });

        if query.statement == PANIC_STATEMENT {
            self.panic_mid_query();
        }

        if self.state.fail_queries.load(Ordering::SeqCst) {
            if self.state.break_on_error.load(Ordering::SeqCst) {
                self.broken = true;
            }
            return Err(MockError::QueryFailed(query.statement.clone()).into());
        }

        Ok(MockRows {
            connection_id: self.id,
            statement: query.statement.clone(),
            param_count: query.params.len(),
        })
    }

    async fn end(&mut self) -> Result<(), BoxError> {
        self.state.record(MockOp::End(self.id));
        Ok(())
    }

    fn detach_all_observers(&mut self) {
        self.observers = 0;
        self.state.record(MockOp::Detach(self.id));
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    type Config = String;
    type Connection = MockConnection;

    async fn create_connection(&self, address: &String) -> Result<MockConnection, BoxError> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            tracing::debug!(address = %address, "mock refusing connection");
            return Err(MockError::ConnectionRefused.into());
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.record(MockOp::Connect(id));
        Ok(MockConnection {
            id,
            state: Arc::clone(&self.state),
            observers: 0,
            broken: false,
        })
    }

    fn create_query(&self, statement: &str, params: &[Value]) -> MockQuery {
        self.state.record(MockOp::CreateQuery(statement.to_string()));
        MockQuery {
            statement: statement.to_string(),
            params: params.to_vec(),
        }
    }

    async fn reset(&self, connection: &mut MockConnection) -> Result<(), BoxError> {
        self.state.record(MockOp::Reset(connection.id));
        if self.state.fail_resets.load(Ordering::SeqCst) {
            return Err(MockError::ResetFailed(connection.id).into());
        }
        Ok(())
    }
}

/// Build a pool over a clone of `adapter`.
///
/// # Panics
///
/// Panics if `config` is invalid.
#[allow(clippy::expect_used)]
pub async fn mock_pool(adapter: &MockAdapter, config: PoolConfig) -> ConnectionPool<MockAdapter> {
    ConnectionPool::new(adapter.clone(), "mock://localhost".to_string(), config)
        .await
        .expect("mock pool configuration must be valid")
}

/// Records every lifecycle event a pool emits.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<PoolEvent>>>,
}

impl EventRecorder {
    /// Subscribe a new recorder to every event of `pool`.
    pub fn attach<A: Adapter>(pool: &ConnectionPool<A>) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.events);
        pool.events()
            .subscribe_all(move |event| sink.lock().push(event.clone()));
        recorder
    }

    /// Recorded events, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    /// Kinds of the recorded events, in delivery order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(PoolEvent::kind).collect()
    }

    /// Number of recorded events of `kind`.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Index of the `nth` (zero-based) event of `kind`.
    #[must_use]
    pub fn position(&self, kind: EventKind, nth: usize) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.kind() == kind)
            .nth(nth)
            .map(|(i, _)| i)
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Yield to the runtime until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}
