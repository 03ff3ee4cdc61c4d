//! Connection pool implementation.
//!
//! [`ConnectionPool`] owns the adapter, the pool engine, the reset pipeline,
//! and the event notifier. It decides when a connection is reset and
//! reused and when it is destroyed; the engine only stores and hands out
//! what it is given.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::adapter::{Adapter, OutputOf};
use crate::config::PoolConfig;
use crate::engine::{GenericPool, LogHook, LogLevel, PoolEngine};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventNotifier, ListenerId, PoolEvent};
use crate::factory::{ConnectionFactory, ValidateHook};
use crate::query::{self, QueryHandle};
use crate::reset::{ConnectionHook, HookFuture, ResetPipeline, connection_hook};
use crate::value::Value;

/// An adapter-driven connection pool.
///
/// Cloning is cheap; clones share the same pool.
///
/// # Example
///
/// ```rust,ignore
/// use adapter_pool::{ConnectionPool, EventKind};
///
/// let pool = ConnectionPool::builder(PgAdapter, "postgres://localhost/app".to_string())
///     .min_connections(2)
///     .max_connections(20)
///     .reset(|conn| Box::pin(async move { conn.execute("DISCARD ALL").await }))
///     .build()
///     .await?;
///
/// pool.on(EventKind::Query, |event| tracing::info!(?event, "query issued"));
///
/// let rows = pool.query("SELECT $1::int", vec![1.into()]).await?;
///
/// pool.close().await;
/// ```
pub struct ConnectionPool<A: Adapter> {
    inner: Arc<PoolInner<A>>,
}

struct PoolInner<A: Adapter> {
    adapter: Arc<A>,
    engine: Box<dyn PoolEngine<Resource = A::Connection>>,
    reset: ResetPipeline<A::Connection>,
    events: EventNotifier,
    config: PoolConfig,

    /// Whether `close` has been called.
    closed: AtomicBool,

    /// When the pool was created.
    created_at: Instant,

    metrics: Mutex<PoolMetricsInner>,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    acquisitions_successful: u64,
    acquisitions_failed: u64,
    releases: u64,
    destroys: u64,
    resets_performed: u64,
    resets_failed: u64,
    queries_completed: u64,
    queries_failed: u64,
}

impl<A: Adapter> ConnectionPool<A> {
    /// Create a pool builder for `adapter`, opening connections with `params`.
    #[must_use]
    pub fn builder(adapter: A, params: A::Config) -> PoolBuilder<A> {
        PoolBuilder::new(adapter, params)
    }

    /// Create a pool with the given configuration and no hooks.
    ///
    /// For hooks or a custom engine, use [`ConnectionPool::builder()`].
    pub async fn new(adapter: A, params: A::Config, config: PoolConfig) -> Result<Self> {
        Self::builder(adapter, params).pool_config(config).build().await
    }

    /// Issue a query on a pooled connection.
    ///
    /// The handle is returned immediately; the query runs on a spawned task.
    /// Must be called from within a Tokio runtime.
    pub fn query(&self, statement: &str, params: Vec<Value>) -> QueryHandle<OutputOf<A>> {
        query::spawn(self.clone(), statement, params, |result| result)
    }

    /// Issue a query and deliver its terminal result to `callback`.
    ///
    /// Acquisition failures are delivered to the callback as well. The
    /// returned handle resolves once the callback has run.
    pub fn query_with<F>(&self, statement: &str, params: Vec<Value>, callback: F) -> QueryHandle<()>
    where
        F: FnOnce(Result<OutputOf<A>>) + Send + 'static,
    {
        query::spawn(self.clone(), statement, params, move |result| {
            callback(result);
            Ok(())
        })
    }

    /// Acquire a connection at the default priority.
    ///
    /// The caller owns the connection until it is passed to
    /// [`release`](Self::release) or [`destroy`](Self::destroy).
    pub async fn acquire(&self) -> Result<A::Connection> {
        self.acquire_with_priority(0).await
    }

    /// Acquire a connection, waiting at `priority` if the pool is exhausted.
    ///
    /// Lower values are served first.
    pub async fn acquire_with_priority(&self, priority: u32) -> Result<A::Connection> {
        self.inner.events.emit(&PoolEvent::Acquire);
        tracing::debug!(priority, "acquiring connection from pool");

        match self.inner.engine.acquire(priority).await {
            Ok(conn) => {
                self.inner.metrics.lock().acquisitions_successful += 1;
                Ok(conn)
            }
            Err(e) => {
                self.inner.metrics.lock().acquisitions_failed += 1;
                tracing::debug!(error = %e, "connection acquisition failed");
                Err(Error::Acquire(e))
            }
        }
    }

    /// Reset a connection and return it to the pool.
    ///
    /// If any reset step fails, the connection is destroyed instead.
    pub async fn release(&self, mut conn: A::Connection) {
        self.inner.events.emit(&PoolEvent::Release);
        tracing::debug!("releasing connection to pool");

        match self.inner.reset.run(&mut conn).await {
            Ok(()) => {
                {
                    let mut metrics = self.inner.metrics.lock();
                    metrics.resets_performed += 1;
                    metrics.releases += 1;
                }
                self.inner.engine.release(conn).await;
            }
            Err(e) => {
                {
                    let mut metrics = self.inner.metrics.lock();
                    metrics.resets_performed += 1;
                    metrics.resets_failed += 1;
                    metrics.destroys += 1;
                }
                tracing::warn!(step = e.step, error = %e.source, "reset failed, destroying connection");
                self.inner.engine.destroy(conn).await;
            }
        }
    }

    /// Destroy a connection without resetting it.
    pub async fn destroy(&self, conn: A::Connection) {
        self.inner.metrics.lock().destroys += 1;
        tracing::debug!("destroying connection");
        self.inner.engine.destroy(conn).await;
    }

    /// Close the pool.
    ///
    /// Stops accepting acquisitions, waits for checked-out connections to
    /// come back, destroys every remaining connection, then emits `close`.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        tracing::info!("closing connection pool");

        self.inner.engine.drain().await;
        self.inner.engine.destroy_all_now().await;

        self.inner.events.emit(&PoolEvent::Close);
        tracing::info!("connection pool closed");
    }

    /// Subscribe to one kind of lifecycle event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(kind, handler)
    }

    /// Remove a listener registered with [`on`](Self::on).
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// The event notifier, for listeners on every event kind.
    #[must_use]
    pub fn events(&self) -> &EventNotifier {
        &self.inner.events
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.engine.status()
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            acquisitions_successful: inner.acquisitions_successful,
            acquisitions_failed: inner.acquisitions_failed,
            releases: inner.releases,
            destroys: inner.destroys,
            resets_performed: inner.resets_performed,
            resets_failed: inner.resets_failed,
            queries_completed: inner.queries_completed,
            queries_failed: inner.queries_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub(crate) fn adapter(&self) -> &A {
        &self.inner.adapter
    }

    pub(crate) fn emit(&self, event: &PoolEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn record_query(&self, ok: bool) {
        let mut metrics = self.inner.metrics.lock();
        if ok {
            metrics.queries_completed += 1;
        } else {
            metrics.queries_failed += 1;
        }
    }
}

impl<A: Adapter> Clone for ConnectionPool<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Adapter> fmt::Debug for ConnectionPool<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .field("reset", &self.inner.reset)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ConnectionPool::builder(adapter, params)
///     .max_connections(4)
///     .on_connect(|conn| Box::pin(async move { conn.set_timezone("UTC").await }))
///     .validate(|conn| !conn.is_closed())
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder<A: Adapter> {
    adapter: A,
    params: A::Config,
    pool_config: PoolConfig,
    on_connect: Option<ConnectionHook<A::Connection>>,
    reset: Option<ConnectionHook<A::Connection>>,
    validate: Option<ValidateHook<A::Connection>>,
    log: Option<LogHook>,
}

impl<A: Adapter> PoolBuilder<A> {
    /// Create a new pool builder with default settings.
    pub fn new(adapter: A, params: A::Config) -> Self {
        Self {
            adapter,
            params,
            pool_config: PoolConfig::default(),
            on_connect: None,
            reset: None,
            validate: None,
            log: None,
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Set the interval between idle reaper runs.
    #[must_use]
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.pool_config.reap_interval = interval;
        self
    }

    /// Enable or disable idle reaping.
    #[must_use]
    pub fn refresh_idle(mut self, enabled: bool) -> Self {
        self.pool_config.refresh_idle = enabled;
        self
    }

    /// Set the number of waiter priority levels.
    #[must_use]
    pub fn priority_range(mut self, range: u32) -> Self {
        self.pool_config.priority_range = range;
        self
    }

    /// Run `hook` on every new connection before it is pooled.
    ///
    /// A failing hook fails the acquisition and the connection is torn down.
    #[must_use]
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut A::Connection) -> HookFuture<'c> + Send + Sync + 'static,
    {
        self.on_connect = Some(connection_hook(hook));
        self
    }

    /// Add a reset step run after the adapter's own reset on every release.
    #[must_use]
    pub fn reset<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut A::Connection) -> HookFuture<'c> + Send + Sync + 'static,
    {
        self.reset = Some(connection_hook(hook));
        self
    }

    /// Check idle connections before handing them out.
    ///
    /// Connections failing the check are destroyed.
    #[must_use]
    pub fn validate<F>(mut self, check: F) -> Self
    where
        F: Fn(&A::Connection) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(check));
        self
    }

    /// Receive the engine's log messages.
    #[must_use]
    pub fn log<F>(mut self, hook: F) -> Self
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.log = Some(Arc::new(hook));
        self
    }

    /// Build the pool on the built-in [`GenericPool`] engine.
    pub async fn build(self) -> Result<ConnectionPool<A>> {
        self.build_with_engine(|factory, config, log| GenericPool::new(factory, config.clone(), log))
            .await
    }

    /// Build the pool on an engine constructed by `make_engine`.
    ///
    /// `make_engine` receives the connection factory the engine must use to
    /// create and destroy connections.
    pub async fn build_with_engine<E, M>(self, make_engine: M) -> Result<ConnectionPool<A>>
    where
        E: PoolEngine<Resource = A::Connection>,
        M: FnOnce(ConnectionFactory<A>, &PoolConfig, Option<LogHook>) -> E,
    {
        self.pool_config.validate()?;

        let adapter = Arc::new(self.adapter);
        let factory = ConnectionFactory::new(Arc::clone(&adapter), Arc::new(self.params))
            .with_on_connect(self.on_connect)
            .with_validate(self.validate);
        let engine = make_engine(factory, &self.pool_config, self.log);
        let reset = ResetPipeline::for_adapter(Arc::clone(&adapter), self.reset);

        tracing::info!(
            min = self.pool_config.min_connections,
            max = self.pool_config.max_connections,
            "connection pool created"
        );

        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                adapter,
                engine: Box::new(engine),
                reset,
                events: EventNotifier::new(),
                config: self.pool_config,
                closed: AtomicBool::new(false),
                created_at: Instant::now(),
                metrics: Mutex::new(PoolMetricsInner::default()),
            }),
        })
    }
}

impl<A: Adapter> fmt::Debug for PoolBuilder<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("pool_config", &self.pool_config)
            .field("on_connect", &self.on_connect.is_some())
            .field("reset", &self.reset.is_some())
            .field("validate", &self.validate.is_some())
            .field("log", &self.log.is_some())
            .finish_non_exhaustive()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Total number of connections, including ones being opened.
    pub total: u32,
    /// Number of callers waiting for a connection.
    pub waiting: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Successful acquisitions.
    pub acquisitions_successful: u64,
    /// Failed acquisitions (pool closed, creation failed).
    pub acquisitions_failed: u64,
    /// Connections reset and returned to the pool.
    pub releases: u64,
    /// Connections destroyed explicitly or after a failed reset.
    pub destroys: u64,
    /// Reset pipelines run.
    pub resets_performed: u64,
    /// Reset pipelines that failed.
    pub resets_failed: u64,
    /// Queries that completed successfully.
    pub queries_completed: u64,
    /// Queries whose connection reported an error.
    pub queries_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate acquisition success rate (0.0 to 1.0).
    #[must_use]
    pub fn acquire_success_rate(&self) -> f64 {
        let total = self.acquisitions_successful + self.acquisitions_failed;
        if total == 0 {
            return 1.0;
        }
        self.acquisitions_successful as f64 / total as f64
    }

    /// Calculate reset success rate (0.0 to 1.0).
    #[must_use]
    pub fn reset_success_rate(&self) -> f64 {
        if self.resets_performed == 0 {
            return 1.0;
        }
        let successful = self.resets_performed - self.resets_failed;
        successful as f64 / self.resets_performed as f64
    }
}
