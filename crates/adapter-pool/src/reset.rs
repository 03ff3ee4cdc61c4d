//! Reset pipeline run before a connection returns to the pool.
//!
//! Steps execute in order: the adapter's reset, the caller's reset hook (if
//! any), and finally [`Connection::detach_all_observers`]. The first failing
//! step aborts the pipeline; the caller then destroys the connection instead
//! of pooling it.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::adapter::{Adapter, Connection};
use crate::error::{BoxError, ResetError};

/// Future returned by connection hooks.
pub type HookFuture<'c> = BoxFuture<'c, Result<(), BoxError>>;

/// An async hook operating on a borrowed connection.
///
/// Used for `on_connect` and for reset steps.
pub type ConnectionHook<C> = Arc<dyn for<'c> Fn(&'c mut C) -> HookFuture<'c> + Send + Sync>;

/// Wrap a closure as a [`ConnectionHook`].
///
/// ```rust,ignore
/// let hook = connection_hook(|conn: &mut PgConnection| {
///     Box::pin(async move { conn.execute("DISCARD ALL").await })
/// });
/// ```
pub fn connection_hook<C, F>(hook: F) -> ConnectionHook<C>
where
    F: for<'c> Fn(&'c mut C) -> HookFuture<'c> + Send + Sync + 'static,
{
    Arc::new(hook)
}

/// Name of the mandatory last step.
pub const DETACH_STEP: &str = "detach_observers";

struct ResetStep<C> {
    name: &'static str,
    run: ConnectionHook<C>,
}

/// Ordered, short-circuiting reset steps.
pub struct ResetPipeline<C> {
    steps: Vec<ResetStep<C>>,
}

impl<C: Connection> ResetPipeline<C> {
    /// Create a pipeline that only detaches observers.
    #[must_use]
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Build the pipeline used by a pool: adapter reset, then the optional
    /// caller hook.
    pub fn for_adapter<A>(adapter: Arc<A>, custom: Option<ConnectionHook<C>>) -> Self
    where
        A: Adapter<Connection = C>,
    {
        let adapter_step = connection_hook::<C, _>(move |conn| {
            let adapter = Arc::clone(&adapter);
            Box::pin(async move { adapter.reset(conn).await })
        });

        let mut pipeline = Self::new();
        pipeline.push("adapter", adapter_step);
        if let Some(hook) = custom {
            pipeline.push("custom", hook);
        }
        pipeline
    }

    /// Append a named step, run before observers are detached.
    #[must_use]
    pub fn with_step<F>(mut self, name: &'static str, step: F) -> Self
    where
        F: for<'c> Fn(&'c mut C) -> HookFuture<'c> + Send + Sync + 'static,
    {
        self.push(name, Arc::new(step));
        self
    }

    /// Names of all steps in execution order, including the final detach.
    #[must_use]
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .map(|s| s.name)
            .chain(std::iter::once(DETACH_STEP))
            .collect()
    }

    /// Run every step against `conn`, stopping at the first failure.
    pub async fn run(&self, conn: &mut C) -> Result<(), ResetError> {
        for step in &self.steps {
            tracing::trace!(step = step.name, "running reset step");
            if let Err(source) = (step.run)(conn).await {
                return Err(ResetError {
                    step: step.name,
                    source,
                });
            }
        }

        conn.detach_all_observers();
        Ok(())
    }

    fn push(&mut self, name: &'static str, run: ConnectionHook<C>) {
        self.steps.push(ResetStep { name, run });
    }
}

impl<C: Connection> Default for ResetPipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for ResetPipeline<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.steps.iter().map(|s| s.name).collect();
        f.debug_struct("ResetPipeline").field("steps", &names).finish()
    }
}
