//! # adapter-pool
//!
//! Adapter-driven connection lifecycle orchestration.
//!
//! The pool knows nothing about wire protocols. An [`Adapter`] opens
//! connections and builds query objects; the pool decides when connections
//! are acquired, reset, reused, and destroyed around each unit of work.
//!
//! ## Features
//!
//! - Exactly-once release of the connection bound to every query
//! - Reset pipeline (adapter reset, custom reset, observer detach) before reuse
//! - Connections failing reset are destroyed, never pooled
//! - Post-connect and validation hooks
//! - Built-in engine with min/max sizing, prioritized waiters, and idle reaping
//! - Lifecycle events (`acquire`, `release`, `query`, `close`) for observers
//! - Status and metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use adapter_pool::{ConnectionPool, EventKind, PoolConfig};
//!
//! // Using the builder pattern
//! let pool = ConnectionPool::builder(adapter, params)
//!     .min_connections(2)
//!     .max_connections(20)
//!     .reset(|conn| Box::pin(async move { conn.rollback().await }))
//!     .build()
//!     .await?;
//!
//! // Or using PoolConfig directly
//! let config = PoolConfig::from_options_str("min=2;max=20;idleTimeoutMillis=30000")?;
//! let pool = ConnectionPool::new(adapter, params, config).await?;
//!
//! pool.on(EventKind::Release, |_| tracing::trace!("connection released"));
//!
//! // Issue a query; the connection is released when it finishes
//! let rows = pool.query("SELECT * FROM users WHERE id = $1", vec![42.into()]).await?;
//!
//! // Or check a connection out by hand
//! let conn = pool.acquire().await?;
//! pool.release(conn).await;
//!
//! println!("Pool utilization: {:.1}%", pool.status().utilization());
//! pool.close().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod factory;
pub mod pool;
pub mod query;
pub mod reset;
pub mod value;

// Adapter contract
pub use adapter::{Adapter, Connection, OutputOf, QueryOf};

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::{BoxError, ConnectError, Error, PoolError, ResetError, Result};

// Pool types
pub use pool::{ConnectionPool, PoolBuilder, PoolMetrics, PoolStatus};

// Engine
pub use engine::{GenericPool, LogHook, LogLevel, PoolEngine, ResourceFactory};
pub use factory::{ConnectionFactory, ValidateHook};

// Queries
pub use query::{QueryHandle, QueryState, ReleaseTrigger};
pub use reset::{ConnectionHook, HookFuture, ResetPipeline, connection_hook};

// Events
pub use events::{EventKind, EventNotifier, ListenerId, PoolEvent};

pub use value::Value;
