//! Engine factory backed by an [`Adapter`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::{Adapter, Connection};
use crate::engine::ResourceFactory;
use crate::error::{BoxError, ConnectError};
use crate::reset::ConnectionHook;

/// Synchronous check run on an idle connection before it is handed out.
pub type ValidateHook<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;

/// Creates connections through an adapter and tears them down on destroy.
pub struct ConnectionFactory<A: Adapter> {
    adapter: Arc<A>,
    params: Arc<A::Config>,
    on_connect: Option<ConnectionHook<A::Connection>>,
    validate: Option<ValidateHook<A::Connection>>,
}

impl<A: Adapter> ConnectionFactory<A> {
    /// Create a factory opening connections with `params`.
    pub fn new(adapter: Arc<A>, params: Arc<A::Config>) -> Self {
        Self {
            adapter,
            params,
            on_connect: None,
            validate: None,
        }
    }

    /// Run `hook` on every new connection before it enters the pool.
    #[must_use]
    pub fn with_on_connect(mut self, hook: Option<ConnectionHook<A::Connection>>) -> Self {
        self.on_connect = hook;
        self
    }

    /// Check idle connections with `hook` before handing them out.
    #[must_use]
    pub fn with_validate(mut self, hook: Option<ValidateHook<A::Connection>>) -> Self {
        self.validate = hook;
        self
    }

    async fn connect(&self) -> Result<A::Connection, ConnectError> {
        let mut conn = self
            .adapter
            .create_connection(&self.params)
            .await
            .map_err(ConnectError::Connect)?;

        let Some(hook) = &self.on_connect else {
            return Ok(conn);
        };

        match hook(&mut conn).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                teardown(&mut conn).await;
                Err(ConnectError::OnConnect(e))
            }
        }
    }
}

#[async_trait]
impl<A: Adapter> ResourceFactory for ConnectionFactory<A> {
    type Resource = A::Connection;

    async fn create(&self) -> Result<A::Connection, BoxError> {
        tracing::debug!("opening new connection");
        self.connect().await.map_err(|e| {
            tracing::warn!(error = %e, "failed to open connection");
            BoxError::from(e)
        })
    }

    async fn destroy(&self, mut conn: A::Connection) {
        teardown(&mut conn).await;
        tracing::debug!("connection destroyed");
    }

    fn validate(&self, conn: &A::Connection) -> bool {
        self.validate.as_ref().is_none_or(|check| check(conn))
    }
}

async fn teardown<C: Connection>(conn: &mut C) {
    if let Err(e) = conn.end().await {
        tracing::warn!(error = %e, "error ending connection");
    }
    conn.detach_all_observers();
}

impl<A: Adapter> fmt::Debug for ConnectionFactory<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("on_connect", &self.on_connect.is_some())
            .field("validate", &self.validate.is_some())
            .finish_non_exhaustive()
    }
}
