//! Transaction-per-event sessions over a `sqlx` pool.

use crate::{PostgresConfig, PostgresError};
use context_bus_core::session::{ScopedSession, SessionError, SessionFactory, SessionFuture};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Owns the connection pool for the lifetime of the hosting process.
///
/// Construct once at startup, hand [`factory`](Self::factory) to every bus, and
/// [`close`](Self::close) on shutdown.
///
/// # Example
///
/// ```ignore
/// let manager = PgSessionManager::connect(&PostgresConfig::from_env()?).await?;
/// let bus = ContextBus::builder(manager.factory()?)
///     .with_executors(cart_executors())
///     .build();
/// // ...
/// manager.close().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgSessionManager {
    pool: PgPool,
}

impl PgSessionManager {
    /// Open a pool for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Connect`] if the database cannot be reached.
    #[tracing::instrument(skip_all, fields(host = %config.host, database = %config.database))]
    pub async fn connect(config: &PostgresConfig) -> Result<Self, PostgresError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.uri())
            .await
            .map_err(PostgresError::Connect)?;

        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Session factory for a bus.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Closed`] once the manager has been closed.
    pub fn factory(&self) -> Result<PgSessionFactory, PostgresError> {
        if self.is_closed() {
            return Err(PostgresError::Closed);
        }
        Ok(PgSessionFactory {
            pool: self.pool.clone(),
        })
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool, waiting for checked-out connections to return.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Closed`] if the manager was already closed.
    pub async fn close(&self) -> Result<(), PostgresError> {
        if self.is_closed() {
            return Err(PostgresError::Closed);
        }
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
        Ok(())
    }
}

/// Opens one transaction per persistence event.
#[derive(Debug, Clone)]
pub struct PgSessionFactory {
    pool: PgPool,
}

impl PgSessionFactory {
    /// Factory over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SessionFactory for PgSessionFactory {
    type Session = PgSession;

    fn begin(&self) -> SessionFuture<'_, PgSession> {
        Box::pin(async move {
            if self.pool.is_closed() {
                return Err(SessionError::Unavailable("connection pool is closed".to_string()));
            }
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| SessionError::Begin(e.to_string()))?;
            tracing::trace!("Transaction started");
            Ok(PgSession { tx })
        })
    }
}

/// An open transaction.
///
/// Dereferences to [`PgConnection`], so queries run inside the transaction with
/// `.execute(&mut **session)` or [`connection`](Self::connection). Dropping it
/// without commit rolls the transaction back.
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSession").finish_non_exhaustive()
    }
}

impl PgSession {
    /// The transaction's connection, usable as a `sqlx` executor.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

impl Deref for PgSession {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.tx
    }
}

impl DerefMut for PgSession {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

impl ScopedSession for PgSession {
    fn commit(self) -> SessionFuture<'static, ()> {
        Box::pin(async move {
            self.tx
                .commit()
                .await
                .map_err(|e| SessionError::Commit(e.to_string()))
        })
    }

    fn rollback(self) -> SessionFuture<'static, ()> {
        Box::pin(async move {
            self.tx
                .rollback()
                .await
                .map_err(|e| SessionError::Rollback(e.to_string()))
        })
    }
}
