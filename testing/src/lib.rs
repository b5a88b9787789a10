//! # Context Bus Testing
//!
//! Testing utilities and helpers for the Context Bus.
//!
//! This crate provides:
//! - An in-memory transactional store and session factory
//! - A Given-When-Then harness for sagas
//! - Assertion helpers for drain results
//! - Test tracing setup
//!
//! ## Example
//!
//! ```ignore
//! use context_bus_testing::{InMemorySessionFactory, SagaTest, helpers::init_test_tracing};
//!
//! #[tokio::test]
//! async fn test_add_cart_item() {
//!     init_test_tracing();
//!     let factory = InMemorySessionFactory::new();
//!
//!     SagaTest::new(cart_bus(factory.clone()))
//!         .when_published(AddCartItem::new(user_id, product_id))
//!         .then_sessions(|factory| assert_eq!(factory.stats().rolled_back, 0))
//!         .run()
//!         .await;
//! }
//! ```

pub mod session_mocks;

/// Test helpers and utilities
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Honours `RUST_LOG`, defaulting to `debug` for the bus crates. Safe to call
    /// from every test; only the first call installs.
    pub fn init_test_tracing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("context_bus_runtime=debug,context_bus_testing=debug"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use saga_test::{SagaTest, assertions};
pub use session_mocks::{InMemorySession, InMemorySessionFactory, InMemoryStore, SessionStats};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use context_bus_core::event::{ContextEvent, EventKey};
    use context_bus_runtime::{ContextBus, ContextExecutor};

    #[derive(Clone, Debug)]
    struct Greet(&'static str);

    impl ContextEvent for Greet {
        type Payload = &'static str;

        fn into_payload(self) -> &'static str {
            self.0
        }
    }

    fn greeter() -> ContextBus<InMemorySessionFactory> {
        ContextBus::builder(InMemorySessionFactory::new())
            .with_executor(ContextExecutor::on::<Greet>().handle(|_, name| async move {
                if name.is_empty() {
                    return Err(anyhow::anyhow!("nobody to greet"));
                }
                Ok(Some(format!("hello {name}")))
            }))
            .build()
    }

    #[tokio::test]
    async fn test_saga_results() {
        helpers::init_test_tracing();

        SagaTest::new(greeter())
            .when_published(Greet("ada"))
            .when_published(Greet("alan"))
            .then_results(|capture| {
                assertions::assert_results_for::<Greet, String>(
                    capture,
                    &["hello ada".to_string(), "hello alan".to_string()],
                );
                assertions::assert_drain_order(capture, &[EventKey::of::<Greet>()]);
            })
            .then_sessions(|factory| assert_eq!(factory.stats().begun, 0))
            .run()
            .await;
    }

    #[tokio::test]
    async fn test_saga_error() {
        let bus = SagaTest::new(greeter())
            .when_published(Greet(""))
            .then_error(|error| {
                assert!(error.to_string().contains("nobody to greet"));
            })
            .run()
            .await;

        assert_eq!(bus.pending_batches().await, 0);
    }

    #[tokio::test]
    #[should_panic(expected = "Expected the drain to fail")]
    async fn test_saga_expecting_error_panics_on_success() {
        SagaTest::new(greeter())
            .when_published(Greet("grace"))
            .then_error(|_| {})
            .run()
            .await;
    }
}
