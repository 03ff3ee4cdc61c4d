//! Pool engine contract and the built-in [`GenericPool`].
//!
//! The orchestrator only needs the [`PoolEngine`] contract: acquire, release,
//! destroy, drain, and destroy-all. [`GenericPool`] implements it with
//! min/max sizing, prioritized FIFO waiters, validation on checkout, and a
//! background idle reaper.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::{BoxError, PoolError};
use crate::pool::PoolStatus;

/// Severity passed to a [`LogHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Engine internals (checkouts, hand-offs, reaping).
    Verbose,
    /// Notable state changes.
    Info,
    /// Recoverable failures.
    Warn,
    /// Failures surfaced to callers.
    Error,
}

/// Logging hook receiving engine messages in addition to `tracing` events.
pub type LogHook = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Creates, validates, and destroys pooled resources.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    /// Resource type managed by the pool.
    type Resource: Send + 'static;

    /// Create a new resource.
    async fn create(&self) -> Result<Self::Resource, BoxError>;

    /// Destroy a resource. Failures are the factory's to absorb.
    async fn destroy(&self, resource: Self::Resource);

    /// Check an idle resource before handing it out.
    fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }
}

/// Contract between the connection pool and the engine that owns resources.
#[async_trait]
pub trait PoolEngine: Send + Sync + 'static {
    /// Resource type handed out by the engine.
    type Resource: Send + 'static;

    /// Check out a resource, waiting if the pool is at capacity.
    ///
    /// Lower `priority` values are served first.
    async fn acquire(&self, priority: u32) -> Result<Self::Resource, PoolError>;

    /// Return a checked-out resource for reuse.
    async fn release(&self, resource: Self::Resource);

    /// Destroy a checked-out resource and free its slot.
    async fn destroy(&self, resource: Self::Resource);

    /// Stop accepting acquisitions and wait until every checked-out
    /// resource and pending waiter has settled.
    async fn drain(&self);

    /// Destroy every idle resource immediately.
    async fn destroy_all_now(&self);

    /// Current occupancy.
    fn status(&self) -> PoolStatus;
}

type Waiter<R> = oneshot::Sender<Result<R, PoolError>>;

struct IdleResource<R> {
    resource: R,
    since: Instant,
}

struct EngineState<R> {
    idle: VecDeque<IdleResource<R>>,
    /// One FIFO queue per priority level.
    waiters: Vec<VecDeque<Waiter<R>>>,
    /// Live resources plus creations in flight.
    size: u32,
    /// Resources checked out, or being created for a caller.
    in_use: u32,
    /// Background creations filling `min_connections`.
    pending: u32,
    draining: bool,
}

impl<R> EngineState<R> {
    fn pop_waiter(&mut self) -> Option<Waiter<R>> {
        for queue in &mut self.waiters {
            while let Some(waiter) = queue.pop_front() {
                if !waiter.is_closed() {
                    return Some(waiter);
                }
            }
        }
        None
    }

    fn waiting(&mut self) -> usize {
        for queue in &mut self.waiters {
            queue.retain(|w| !w.is_closed());
        }
        self.waiters.iter().map(VecDeque::len).sum()
    }

    fn is_settled(&mut self) -> bool {
        self.in_use == 0 && self.pending == 0 && self.waiting() == 0
    }
}

struct Shared<F: ResourceFactory> {
    factory: F,
    config: PoolConfig,
    log: Option<LogHook>,
    state: Mutex<EngineState<F::Resource>>,
    settled: Notify,
}

/// General-purpose resource pool engine.
///
/// Must be created inside a Tokio runtime: minimum-size filling, waiter
/// dispatch, and idle reaping run on spawned tasks.
pub struct GenericPool<F: ResourceFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ResourceFactory> GenericPool<F> {
    /// Create an engine around `factory`.
    pub fn new(factory: F, config: PoolConfig, log: Option<LogHook>) -> Self {
        let levels = config.priority_range.max(1) as usize;
        let shared = Arc::new(Shared {
            factory,
            log,
            state: Mutex::new(EngineState {
                idle: VecDeque::new(),
                waiters: (0..levels).map(|_| VecDeque::new()).collect(),
                size: 0,
                in_use: 0,
                pending: 0,
                draining: false,
            }),
            settled: Notify::new(),
            config,
        });

        shared.ensure_minimum();
        if shared.config.refresh_idle && !shared.config.reap_interval.is_zero() {
            tokio::spawn(reap_idle(
                Arc::downgrade(&shared),
                shared.config.reap_interval,
            ));
        }

        Self { shared }
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

#[async_trait]
impl<F: ResourceFactory> PoolEngine for GenericPool<F> {
    type Resource = F::Resource;

    async fn acquire(&self, priority: u32) -> Result<F::Resource, PoolError> {
        let shared = &self.shared;

        loop {
            let next = {
                let mut state = shared.state.lock();
                if state.draining {
                    return Err(PoolError::Draining);
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.in_use += 1;
                    Checkout::Reuse(idle.resource)
                } else if state.size < shared.config.max_connections {
                    state.size += 1;
                    state.in_use += 1;
                    Checkout::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    let level = (priority as usize).min(state.waiters.len() - 1);
                    state.waiters[level].push_back(tx);
                    Checkout::Wait(rx)
                }
            };

            match next {
                Checkout::Reuse(resource) => {
                    if shared.factory.validate(&resource) {
                        shared.log(LogLevel::Verbose, "dispensing idle resource");
                        return Ok(resource);
                    }
                    shared.log(LogLevel::Verbose, "idle resource failed validation");
                    shared.destroy_checked_out(resource).await;
                }
                Checkout::Create => {
                    let slot = SlotGuard::new(shared);
                    return match shared.factory.create().await {
                        Ok(resource) => {
                            slot.disarm();
                            shared.log(LogLevel::Verbose, "created resource");
                            Ok(resource)
                        }
                        Err(e) => {
                            shared.log(LogLevel::Error, &format!("resource creation failed: {e}"));
                            Err(PoolError::Create(e))
                        }
                    };
                }
                Checkout::Wait(rx) => {
                    shared.log(LogLevel::Verbose, "pool exhausted, queueing acquisition");
                    let mut queued = QueuedAcquire { shared, rx };
                    return (&mut queued.rx).await.unwrap_or(Err(PoolError::Dropped));
                }
            }
        }
    }

    async fn release(&self, resource: F::Resource) {
        self.shared.hand_off(resource, true);
    }

    async fn destroy(&self, resource: F::Resource) {
        self.shared.destroy_checked_out(resource).await;
    }

    async fn drain(&self) {
        self.shared.state.lock().draining = true;
        self.shared.log(LogLevel::Info, "draining pool");

        loop {
            let settled = self.shared.settled.notified();
            if self.shared.state.lock().is_settled() {
                break;
            }
            settled.await;
        }
    }

    async fn destroy_all_now(&self) {
        let idle: Vec<_> = {
            let mut state = self.shared.state.lock();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.size = state.size.saturating_sub(idle.len() as u32);
            idle
        };

        self.shared.log(
            LogLevel::Info,
            &format!("destroying {} idle resources", idle.len()),
        );
        for entry in idle {
            self.shared.factory.destroy(entry.resource).await;
        }
        self.shared.settled.notify_waiters();
    }

    fn status(&self) -> PoolStatus {
        let mut state = self.shared.state.lock();
        PoolStatus {
            available: state.idle.len() as u32,
            in_use: state.in_use,
            total: state.size,
            waiting: state.waiting() as u32,
            max: self.shared.config.max_connections,
        }
    }
}

enum Checkout<R> {
    Reuse(R),
    Create,
    Wait(oneshot::Receiver<Result<R, PoolError>>),
}

/// Frees a reserved creation slot unless disarmed.
struct SlotGuard<'a, F: ResourceFactory> {
    shared: &'a Arc<Shared<F>>,
    armed: bool,
}

impl<'a, F: ResourceFactory> SlotGuard<'a, F> {
    fn new(shared: &'a Arc<Shared<F>>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: ResourceFactory> Drop for SlotGuard<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon_slot();
        }
    }
}

/// Returns a resource that was sent to a waiter which went away before
/// receiving it.
struct QueuedAcquire<'a, F: ResourceFactory> {
    shared: &'a Arc<Shared<F>>,
    rx: oneshot::Receiver<Result<F::Resource, PoolError>>,
}

impl<F: ResourceFactory> Drop for QueuedAcquire<'_, F> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Ok(resource)) = self.rx.try_recv() {
            self.shared
                .log(LogLevel::Verbose, "waiter dropped, returning resource");
            self.shared.hand_off(resource, true);
        }
    }
}

impl<F: ResourceFactory> Shared<F> {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Verbose => tracing::trace!("{message}"),
            LogLevel::Info => tracing::debug!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
        if let Some(hook) = &self.log {
            hook(level, message);
        }
    }

    /// Give a resource to the first live waiter, or park it idle.
    ///
    /// `checked_out` is true when the resource was counted in `in_use`.
    fn hand_off(&self, resource: F::Resource, checked_out: bool) {
        let mut state = self.state.lock();
        let handed = Self::place(&mut state, resource, checked_out);
        drop(state);

        if handed {
            self.log(LogLevel::Verbose, "handed resource to waiter");
        } else {
            self.settled.notify_waiters();
        }
    }

    /// Send `resource` to the first live waiter or push it idle, under the
    /// caller's lock. Returns true if a waiter took it.
    fn place(
        state: &mut EngineState<F::Resource>,
        mut resource: F::Resource,
        checked_out: bool,
    ) -> bool {
        while let Some(waiter) = state.pop_waiter() {
            match waiter.send(Ok(resource)) {
                Ok(()) => {
                    if !checked_out {
                        state.in_use += 1;
                    }
                    return true;
                }
                Err(returned) => match returned {
                    Ok(r) => resource = r,
                    Err(_) => return true,
                },
            }
        }

        if checked_out {
            state.in_use = state.in_use.saturating_sub(1);
        }
        state.idle.push_back(IdleResource {
            resource,
            since: Instant::now(),
        });
        false
    }

    async fn destroy_checked_out(self: &Arc<Self>, resource: F::Resource) {
        self.factory.destroy(resource).await;
        {
            let mut state = self.state.lock();
            state.size = state.size.saturating_sub(1);
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.log(LogLevel::Verbose, "destroyed resource");
        self.settled.notify_waiters();
        self.dispatch_waiters();
        self.ensure_minimum();
    }

    /// Release a slot reserved for a creation that failed.
    fn abandon_slot(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.size = state.size.saturating_sub(1);
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.settled.notify_waiters();
        self.dispatch_waiters();
    }

    /// Create resources for queued callers while below `max_connections`.
    fn dispatch_waiters(self: &Arc<Self>) {
        let mut claimed = Vec::new();
        {
            let mut state = self.state.lock();
            while state.size < self.config.max_connections {
                let Some(waiter) = state.pop_waiter() else {
                    break;
                };
                state.size += 1;
                state.in_use += 1;
                claimed.push(waiter);
            }
        }

        for waiter in claimed {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                match shared.factory.create().await {
                    Ok(resource) => {
                        if let Err(Ok(resource)) = waiter.send(Ok(resource)) {
                            shared.hand_off(resource, true);
                        }
                    }
                    Err(e) => {
                        shared.log(LogLevel::Error, &format!("resource creation failed: {e}"));
                        let _ = waiter.send(Err(PoolError::Create(e)));
                        shared.abandon_slot();
                    }
                }
            });
        }
    }

    /// Top the pool up to `min_connections` in the background.
    fn ensure_minimum(self: &Arc<Self>) {
        let missing = {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            let missing = self.config.min_connections.saturating_sub(state.size);
            state.size += missing;
            state.pending += missing;
            missing
        };

        for _ in 0..missing {
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                match shared.factory.create().await {
                    Ok(resource) => {
                        // Counted as pending until parked or destroyed.
                        let rejected = {
                            let mut state = shared.state.lock();
                            if state.draining {
                                Some(resource)
                            } else {
                                state.pending = state.pending.saturating_sub(1);
                                Self::place(&mut state, resource, false);
                                None
                            }
                        };
                        if let Some(resource) = rejected {
                            shared.factory.destroy(resource).await;
                            let mut state = shared.state.lock();
                            state.pending = state.pending.saturating_sub(1);
                            state.size = state.size.saturating_sub(1);
                        }
                        shared.settled.notify_waiters();
                    }
                    Err(e) => {
                        {
                            let mut state = shared.state.lock();
                            state.pending = state.pending.saturating_sub(1);
                            state.size = state.size.saturating_sub(1);
                        }
                        shared.log(
                            LogLevel::Warn,
                            &format!("failed to create minimum resource: {e}"),
                        );
                        shared.settled.notify_waiters();
                        shared.dispatch_waiters();
                    }
                }
            });
        }
    }

    /// Destroy resources idle past `idle_timeout`, keeping `min_connections`.
    async fn reap(self: &Arc<Self>) {
        let expired: Vec<_> = {
            let mut state = self.state.lock();
            let floor = self.config.min_connections;
            let mut size = state.size;
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());

            for entry in state.idle.drain(..) {
                if size > floor && entry.since.elapsed() >= self.config.idle_timeout {
                    size -= 1;
                    expired.push(entry.resource);
                } else {
                    kept.push_back(entry);
                }
            }
            state.idle = kept;
            state.size = size;
            expired
        };

        if expired.is_empty() {
            return;
        }
        self.log(
            LogLevel::Verbose,
            &format!("reaping {} idle resources", expired.len()),
        );
        for resource in expired {
            self.factory.destroy(resource).await;
        }
        self.ensure_minimum();
    }
}

async fn reap_idle<F: ResourceFactory>(shared: Weak<Shared<F>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.state.lock().draining {
            break;
        }
        shared.reap().await;
    }
}

impl<F: ResourceFactory> fmt::Debug for GenericPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericPool")
            .field("config", &self.shared.config)
            .field("status", &self.status())
            .finish()
    }
}
