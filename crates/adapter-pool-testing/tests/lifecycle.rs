//! Lifecycle integration tests.
//!
//! Drive a real `ConnectionPool` over the mock adapter and check acquisition,
//! reset, release, destroy, and close behaviour end to end.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use adapter_pool::{BoxError, ConnectionPool, Error, EventKind, PoolConfig, PoolError, QueryState};
use adapter_pool_testing::{EventRecorder, MockAdapter, MockOp, init_tracing, mock_pool, wait_until};
use parking_lot::Mutex;

fn single() -> PoolConfig {
    PoolConfig::new().max_connections(1).refresh_idle(false)
}

// =============================================================================
// Event ordering
// =============================================================================

#[tokio::test]
async fn test_events_precede_result_delivery() {
    init_tracing();
    let adapter = MockAdapter::new();
    let pool = mock_pool(&adapter, single()).await;

    let trail = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&trail);
    pool.events()
        .subscribe_all(move |event| sink.lock().push(event.kind().as_str().to_string()));

    let sink = Arc::clone(&trail);
    pool.query_with("SELECT 1", vec![], move |result| {
        assert!(result.is_ok());
        sink.lock().push("result".to_string());
    })
    .await
    .unwrap();

    assert_eq!(*trail.lock(), vec!["acquire", "query", "release", "result"]);
}

#[tokio::test]
async fn test_query_event_carries_statement_and_params() {
    let adapter = MockAdapter::new();
    let pool = mock_pool(&adapter, single()).await;
    let events = EventRecorder::attach(&pool);

    let rows = pool
        .query("SELECT * FROM users WHERE id = $1", vec![42_i64.into()])
        .await
        .unwrap();
    assert_eq!(rows.param_count, 1);

    let query = events
        .events()
        .into_iter()
        .find(|e| e.kind() == EventKind::Query)
        .unwrap();
    assert_eq!(
        query,
        adapter_pool::PoolEvent::Query {
            statement: "SELECT * FROM users WHERE id = $1".to_string(),
            params: vec![42_i64.into()],
        }
    );
}

// =============================================================================
// Serialization and reuse
// =============================================================================

#[tokio::test]
async fn test_single_connection_serializes_queries() {
    let adapter = MockAdapter::new();
    adapter.close_gate();
    let pool = mock_pool(&adapter, single()).await;
    let events = EventRecorder::attach(&pool);

    let first = pool.query("SELECT 1", vec![]);
    let second = pool.query("SELECT 2", vec![]);

    wait_until(|| first.state() == QueryState::Bound && pool.status().waiting == 1).await;
    assert_eq!(second.state(), QueryState::Pending);
    assert_eq!(events.count(EventKind::Query), 1);

    adapter.open_gate(2);
    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert_eq!(first.connection_id, second.connection_id);
    assert_eq!(adapter.connections_created(), 1);

    let first_release = events.position(EventKind::Release, 0).unwrap();
    let second_query = events.position(EventKind::Query, 1).unwrap();
    assert!(first_release < second_query);
}

#[tokio::test]
async fn test_connection_is_reset_before_reuse() {
    let adapter = MockAdapter::new();
    let pool = mock_pool(&adapter, single()).await;

    let first = pool.query("SELECT 1", vec![]).await.unwrap();
    let second = pool.query("SELECT 2", vec![]).await.unwrap();
    assert_eq!(first.connection_id, second.connection_id);

    let id = first.connection_id;
    assert_eq!(
        adapter.ops_for(id),
        vec![
            MockOp::Connect(id),
            MockOp::Query {
                connection: id,
                statement: "SELECT 1".into()
            },
            MockOp::Reset(id),
            MockOp::Detach(id),
            MockOp::Query {
                connection: id,
                statement: "SELECT 2".into()
            },
            MockOp::Reset(id),
            MockOp::Detach(id),
        ]
    );
}

// =============================================================================
// Acquisition failures
// =============================================================================

#[tokio::test]
async fn test_connect_failure_reaches_callback_and_never_binds() {
    let adapter = MockAdapter::new();
    adapter.refuse_connections(true);
    let pool = mock_pool(&adapter, single()).await;
    let events = EventRecorder::attach(&pool);

    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let mut handle = pool.query_with("SELECT 1", vec![], move |result| {
        *sink.lock() = Some(result.map(|_| ()));
    });
    (&mut handle).await.unwrap();
    let state = handle.state();

    let result = seen.lock().take().unwrap();
    let err = result.unwrap_err();
    assert!(err.is_acquire());
    assert!(matches!(err, Error::Acquire(PoolError::Create(_))));
    assert!(err.to_string().contains("connection refused"));

    assert_eq!(state, QueryState::Pending);
    assert_eq!(adapter.queries_executed(), 0);
    assert_eq!(events.count(EventKind::Query), 0);
    assert_eq!(events.count(EventKind::Release), 0);
    assert_eq!(pool.status().total, 0);
    assert_eq!(pool.metrics().acquisitions_failed, 1);
}

#[tokio::test]
async fn test_connect_failure_without_callback_fails_handle() {
    let adapter = MockAdapter::new();
    adapter.refuse_connections(true);
    let pool = mock_pool(&adapter, single()).await;

    let err = pool.query("SELECT 1", vec![]).await.unwrap_err();
    assert!(err.is_acquire());

    adapter.refuse_connections(false);
    assert!(pool.query("SELECT 1", vec![]).await.is_ok());
}

#[tokio::test]
async fn test_on_connect_failure_tears_connection_down() {
    let adapter = MockAdapter::new();
    let pool = ConnectionPool::builder(adapter.clone(), "mock://localhost".to_string())
        .max_connections(1)
        .refresh_idle(false)
        .on_connect(|_conn| Box::pin(async { Err(BoxError::from("SET TIME ZONE failed")) }))
        .build()
        .await
        .unwrap();

    let err = pool.query("SELECT 1", vec![]).await.unwrap_err();
    assert!(err.is_acquire());
    assert!(std::error::Error::source(&err).is_some());

    assert_eq!(adapter.connections_created(), 1);
    assert_eq!(adapter.connections_ended(), 1);
    assert_eq!(adapter.queries_executed(), 0);
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_on_connect_runs_once_per_connection() {
    let adapter = MockAdapter::new();
    let hooked = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hooked);
    let pool = ConnectionPool::builder(adapter.clone(), "mock://localhost".to_string())
        .max_connections(1)
        .refresh_idle(false)
        .on_connect(move |conn| {
            sink.lock().push(conn.id());
            Box::pin(async { Ok(()) })
        })
        .build()
        .await
        .unwrap();

    for _ in 0..3 {
        pool.query("SELECT 1", vec![]).await.unwrap();
    }
    assert_eq!(*hooked.lock(), vec![1]);
}

// =============================================================================
// Reset failures
// =============================================================================

#[tokio::test]
async fn test_failing_adapter_reset_prevents_reuse() {
    let adapter = MockAdapter::new();
    adapter.fail_resets(true);
    let pool = mock_pool(&adapter, single()).await;

    let mut served = Vec::new();
    for _ in 0..3 {
        served.push(pool.query("SELECT 1", vec![]).await.unwrap().connection_id);
    }

    assert_eq!(served, vec![1, 2, 3]);
    assert_eq!(adapter.connections_created(), 3);
    assert_eq!(adapter.connections_ended(), 3);

    let metrics = pool.metrics();
    assert_eq!(metrics.resets_failed, 3);
    assert_eq!(metrics.releases, 0);
    assert_eq!(metrics.destroys, 3);
}

#[tokio::test]
async fn test_failing_custom_reset_short_circuits() {
    let adapter = MockAdapter::new();
    let later = Arc::new(Mutex::new(0_u32));
    let pool = ConnectionPool::builder(adapter.clone(), "mock://localhost".to_string())
        .max_connections(1)
        .refresh_idle(false)
        .reset(|_conn| Box::pin(async { Err(BoxError::from("ROLLBACK failed")) }))
        .build()
        .await
        .unwrap();
    let counter = Arc::clone(&later);
    pool.on(EventKind::Release, move |_| *counter.lock() += 1);

    let rows = pool.query("SELECT 1", vec![]).await.unwrap();
    let id = rows.connection_id;

    // Adapter reset ran, the custom step failed, observers were only detached
    // by teardown.
    assert_eq!(
        adapter.ops_for(id),
        vec![
            MockOp::Connect(id),
            MockOp::Query {
                connection: id,
                statement: "SELECT 1".into()
            },
            MockOp::Reset(id),
            MockOp::End(id),
            MockOp::Detach(id),
        ]
    );
    assert_eq!(*later.lock(), 1);
    assert_eq!(pool.status().total, 0);
}

#[tokio::test]
async fn test_custom_reset_runs_after_adapter_reset() {
    let adapter = MockAdapter::new();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let probe = adapter.clone();
    let pool = ConnectionPool::builder(adapter.clone(), "mock://localhost".to_string())
        .max_connections(1)
        .refresh_idle(false)
        .reset(move |conn| {
            sink.lock().push((probe.resets(), conn.observers()));
            Box::pin(async { Ok(()) })
        })
        .build()
        .await
        .unwrap();

    pool.query("SELECT 1", vec![]).await.unwrap();

    // One adapter reset already done, observers not yet detached.
    assert_eq!(*observed.lock(), vec![(1, 1)]);
}

// =============================================================================
// Close
// =============================================================================

#[tokio::test]
async fn test_close_then_acquire_fails() {
    let adapter = MockAdapter::new();
    let pool = mock_pool(&adapter, PoolConfig::new().max_connections(2).refresh_idle(false)).await;
    let events = EventRecorder::attach(&pool);

    pool.query("SELECT 1", vec![]).await.unwrap();
    pool.close().await;

    assert!(pool.is_closed());
    assert_eq!(events.count(EventKind::Close), 1);
    assert_eq!(adapter.connections_ended(), adapter.connections_created());

    let created = adapter.connections_created();
    let err = pool.acquire().await.unwrap_err();
    assert!(err.is_closed());
    assert_eq!(adapter.connections_created(), created);

    let err = pool.query("SELECT 1", vec![]).await.unwrap_err();
    assert!(err.is_closed());
}

#[tokio::test]
async fn test_close_waits_for_in_flight_query() {
    let adapter = MockAdapter::new();
    adapter.close_gate();
    let pool = mock_pool(&adapter, single()).await;
    let events = EventRecorder::attach(&pool);

    let query = pool.query("SELECT pg_sleep(1)", vec![]);
    wait_until(|| query.state() == QueryState::Bound).await;

    let closing = tokio::spawn({
        let pool = pool.clone();
        async move { pool.close().await }
    });
    wait_until(|| pool.is_closed()).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!closing.is_finished());
    assert_eq!(events.count(EventKind::Close), 0);

    adapter.open_gate(1);
    query.await.unwrap();
    closing.await.unwrap();

    let release = events.position(EventKind::Release, 0).unwrap();
    let close = events.position(EventKind::Close, 0).unwrap();
    assert!(release < close);
    assert_eq!(adapter.connections_ended(), 1);
}

#[tokio::test]
async fn test_min_connections_are_torn_down_on_close() {
    let adapter = MockAdapter::new();
    let pool = mock_pool(
        &adapter,
        PoolConfig::new()
            .min_connections(2)
            .max_connections(4)
            .refresh_idle(false),
    )
    .await;

    wait_until(|| pool.status().available == 2).await;
    pool.close().await;

    assert_eq!(adapter.connections_created(), 2);
    assert_eq!(adapter.connections_ended(), 2);
    assert_eq!(pool.status().total, 0);
}

// =============================================================================
// Manual checkout
// =============================================================================

#[tokio::test]
async fn test_manual_acquire_release_and_destroy() {
    let adapter = MockAdapter::new();
    let pool = mock_pool(&adapter, single()).await;
    let events = EventRecorder::attach(&pool);

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();
    pool.release(conn).await;

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.id(), id);
    pool.destroy(conn).await;

    let conn = pool.acquire().await.unwrap();
    assert_ne!(conn.id(), id);
    pool.release(conn).await;

    assert_eq!(
        events.kinds(),
        vec![
            EventKind::Acquire,
            EventKind::Release,
            EventKind::Acquire,
            EventKind::Acquire,
            EventKind::Release,
        ]
    );
    // destroy bypasses reset
    assert_eq!(adapter.resets(), 2);
}

#[tokio::test]
async fn test_cancelled_acquire_does_not_leak_connection() {
    let adapter = MockAdapter::new();
    let pool = mock_pool(&adapter, single()).await;

    let held = pool.acquire().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    wait_until(|| pool.status().waiting == 1).await;

    pool.release(held).await;
    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());

    let status = pool.status();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 1);

    let conn = tokio::time::timeout(std::time::Duration::from_secs(1), pool.acquire())
        .await
        .expect("connection was lost")
        .unwrap();
    pool.release(conn).await;

    tokio::time::timeout(std::time::Duration::from_secs(1), pool.close())
        .await
        .expect("close hung");
    assert_eq!(adapter.connections_created(), 1);
    assert_eq!(adapter.connections_ended(), 1);
}

#[tokio::test]
async fn test_panicking_listener_does_not_disturb_lifecycle() {
    let adapter = MockAdapter::new();
    let pool = mock_pool(&adapter, single()).await;
    pool.on(EventKind::Acquire, |_| panic!("listener bug"));
    pool.on(EventKind::Release, |_| panic!("listener bug"));

    let rows = pool.query("SELECT 1", vec![]).await.unwrap();
    assert_eq!(rows.statement, "SELECT 1");
    assert_eq!(pool.status().available, 1);
}

#[tokio::test]
async fn test_off_removes_listener() {
    let adapter = MockAdapter::new();
    let pool = mock_pool(&adapter, single()).await;
    let hits = Arc::new(Mutex::new(0_u32));
    let counter = Arc::clone(&hits);
    let id = pool.on(EventKind::Acquire, move |_| *counter.lock() += 1);

    pool.query("SELECT 1", vec![]).await.unwrap();
    assert!(pool.off(id));
    pool.query("SELECT 1", vec![]).await.unwrap();

    assert_eq!(*hits.lock(), 1);
}
