//! `PostgreSQL` sessions for the Context Bus.
//!
//! This crate implements the bus's `SessionFactory` over a `sqlx` connection pool:
//! every persistence event runs inside its own transaction, committed when its
//! handler succeeds and rolled back otherwise.
//!
//! - [`PostgresConfig`]: connection settings read from `DB_*` environment variables
//! - [`PgSessionManager`]: owns the pool, with explicit `connect` and `close`
//! - [`PgSessionFactory`] / [`PgSession`]: one transaction per event
//!
//! # Example
//!
//! ```ignore
//! use context_bus_postgres::{PgSessionManager, PostgresConfig};
//!
//! let manager = PgSessionManager::connect(&PostgresConfig::from_env()?).await?;
//! let bus = ContextBus::builder(manager.factory()?).build();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod session;

pub use config::PostgresConfig;
pub use session::{PgSession, PgSessionFactory, PgSessionManager};

use thiserror::Error;

/// Errors from connecting to or configuring the database.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// The pool could not connect
    #[error("Failed to connect to PostgreSQL: {0}")]
    Connect(#[source] sqlx::Error),

    /// An environment variable holds an unusable value
    #[error("Invalid value {value:?} for {name}")]
    InvalidConfig {
        /// Variable name
        name: &'static str,
        /// Offending value
        value: String,
    },

    /// The session manager was already closed
    #[error("Session manager is closed")]
    Closed,
}
