//! # Context Bus Runtime
//!
//! Runtime implementation of the Context Bus.
//!
//! This crate provides the orchestrator that runs a request-scoped saga: handlers
//! bound to event types react to published events, may publish further events
//! while they run, and are drained to a fixed point by [`ContextBus::gather`].
//!
//! ## Core Components
//!
//! - **`ContextBus`**: Registry of executor bindings plus the pending batch queue
//! - **`ContextExecutor`**: One (event type → handler) binding, including the
//!   transaction-scoping proxy for persistence events
//! - **`TaskRecord`**: A started handler invocation
//!
//! ## Example
//!
//! ```ignore
//! use context_bus_runtime::{ContextBus, ContextExecutor};
//!
//! let bus = ContextBus::builder(session_factory)
//!     .with_executor(ContextExecutor::on::<GetUserCart>().handle_in_session(
//!         move |bus, event| { let carts = carts.clone(); async move { carts.execute(bus, event).await } },
//!     ))
//!     .build();
//!
//! bus.publish(GetUserCart::new(user_id)).await;
//! let capture = bus.gather().await?;
//!
//! let response = Composable::new(serde_json::Map::new())
//!     .with_reducer(|resp, result: GetUserCartResult| set_key(resp, "cart", result.cart_id.to_string()))
//!     .reduce(capture.flatten());
//! ```

use std::time::Duration;

/// The bus: registry, pending queue and the drain loop
pub mod bus;

/// Executor bindings and task records
pub mod executor;

/// Prometheus metrics for observability
pub mod metrics;

/// Error types for the bus runtime
pub mod error {
    use context_bus_core::session::SessionError;
    use std::fmt::{Debug, Display};
    use thiserror::Error;

    /// Errors that abort a drain
    ///
    /// Any of these returned from [`gather`](crate::ContextBus::gather) means the
    /// saga stopped at its current frontier: batches still queued were abandoned
    /// and sessions already committed by earlier handlers stay committed.
    #[derive(Error, Debug)]
    pub enum BusError {
        /// A handler returned an error
        ///
        /// The handler's own session (if any) was rolled back before this error
        /// was produced.
        #[error("Handler for {event} failed: {source}")]
        Handler {
            /// Type name of the event being handled
            event: &'static str,
            /// The handler's error
            #[source]
            source: anyhow::Error,
        },

        /// A handler task panicked or was cancelled
        #[error("Task for {event} did not complete: {source}")]
        TaskJoin {
            /// Type name of the event being handled
            event: &'static str,
            /// The join failure
            #[source]
            source: tokio::task::JoinError,
        },

        /// Opening, committing or rolling back a session failed
        #[error("Session failure while handling {event}: {source}")]
        Session {
            /// Type name of the event being handled
            event: &'static str,
            /// The session failure
            #[source]
            source: SessionError,
        },

        /// More batches were queued than the configured limit allows
        ///
        /// Usually a handler that keeps publishing the event it handles.
        #[error("Drain exceeded the limit of {limit} batches")]
        DrainLimitExceeded {
            /// The configured limit
            limit: usize,
        },
    }

    impl BusError {
        /// Type name of the event whose handling failed, if the failure came from
        /// a handler task.
        #[must_use]
        pub const fn event(&self) -> Option<&'static str> {
            match self {
                Self::Handler { event, .. }
                | Self::TaskJoin { event, .. }
                | Self::Session { event, .. } => Some(event),
                Self::DrainLimitExceeded { .. } => None,
            }
        }

        /// The handler's own error, when this is a [`BusError::Handler`].
        #[must_use]
        pub const fn handler_error(&self) -> Option<&anyhow::Error> {
            match self {
                Self::Handler { source, .. } => Some(source),
                _ => None,
            }
        }

        /// Downcast the handler's error to a concrete domain error.
        ///
        /// Lets API layers map specific failures (e.g. "already in cart") to their
        /// own responses.
        #[must_use]
        pub fn downcast_ref<E>(&self) -> Option<&E>
        where
            E: Display + Debug + Send + Sync + 'static,
        {
            self.handler_error().and_then(anyhow::Error::downcast_ref::<E>)
        }
    }
}

pub use bus::{ContextBus, ContextBusBuilder};
pub use error::BusError;
pub use executor::{ContextExecutor, ExecutorBuilder, TaskRecord};

/// Configuration for `ContextBus` instances
///
/// # Example
///
/// ```
/// use context_bus_runtime::BusConfig;
///
/// let config = BusConfig::default()
///     .with_max_batches(500)
///     .with_abort_abandoned(false);
///
/// assert_eq!(config.max_batches, 500);
/// ```
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum number of batches one `gather` call will drain
    ///
    /// Termination of a drain depends on handlers not publishing unboundedly.
    /// Hitting this limit fails the drain with `BusError::DrainLimitExceeded`.
    pub max_batches: usize,
    /// Abort the tasks of batches abandoned after a failure
    ///
    /// When false, abandoned tasks keep running detached and their results are
    /// discarded. Either way, events they publish after the drain failed are
    /// dropped and never reach a later `gather`. Sessions those tasks commit
    /// stay committed.
    pub abort_abandoned: bool,
    /// Emit a `warn!` when a single batch takes longer than this
    pub slow_batch_threshold: Option<Duration>,
}

impl BusConfig {
    /// Create a new configuration with custom values
    #[must_use]
    pub const fn new(
        max_batches: usize,
        abort_abandoned: bool,
        slow_batch_threshold: Option<Duration>,
    ) -> Self {
        Self {
            max_batches,
            abort_abandoned,
            slow_batch_threshold,
        }
    }

    /// Set the maximum number of batches per drain
    #[must_use]
    pub const fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = max_batches;
        self
    }

    /// Set whether abandoned tasks are aborted
    #[must_use]
    pub const fn with_abort_abandoned(mut self, abort: bool) -> Self {
        self.abort_abandoned = abort;
        self
    }

    /// Set the slow batch warning threshold
    #[must_use]
    pub const fn with_slow_batch_threshold(mut self, threshold: Duration) -> Self {
        self.slow_batch_threshold = Some(threshold);
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_batches: 10_000,
            abort_abandoned: true,
            slow_batch_threshold: None,
        }
    }
}
