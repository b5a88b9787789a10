//! Integration tests for `PgSessionFactory` using testcontainers.
//!
//! # Requirements
//!
//! Docker must be running to execute these tests. The tests will automatically start a
//! `PostgreSQL` container using testcontainers.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use context_bus_core::session::{SessionScope, attached};
use context_bus_macros::{ContextEvent, PersistenceEvent};
use context_bus_postgres::{PgSession, PgSessionManager, PostgresConfig, PostgresError};
use context_bus_runtime::{BusError, ContextBus, ContextExecutor};
use std::sync::Arc;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;

#[derive(ContextEvent, PersistenceEvent, Clone, Debug)]
struct InsertRow {
    id: String,
    value: i64,
    #[session]
    session: Option<SessionScope<PgSession>>,
}

impl InsertRow {
    fn new(id: &str, value: i64) -> Self {
        Self {
            id: id.to_string(),
            value,
            session: None,
        }
    }
}

/// Start a Postgres container and connect a session manager to it.
///
/// Returns both the container (to keep it alive) and the manager.
///
/// # Panics
/// Panics if container setup fails (test environment issue).
async fn setup_manager() -> (ContainerAsync<Postgres>, PgSessionManager) {
    let container = Postgres::default()
        .start()
        .await
        .expect("Failed to start postgres container");

    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get postgres port");

    let config = PostgresConfig::default()
        .with_host("127.0.0.1")
        .with_port(port)
        .with_credentials("postgres", "postgres")
        .with_max_connections(4);

    let mut retries = 0;
    let max_retries = 60;
    loop {
        if let Ok(manager) = PgSessionManager::connect(&config).await {
            if sqlx::query("SELECT 1").execute(manager.pool()).await.is_ok() {
                sqlx::query("CREATE TABLE IF NOT EXISTS rows (id TEXT PRIMARY KEY, value BIGINT NOT NULL)")
                    .execute(manager.pool())
                    .await
                    .expect("Failed to create rows table");
                return (container, manager);
            }
        }

        assert!(retries < max_retries, "Failed to connect after {max_retries} retries");
        retries += 1;
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }
}

async fn row_value(manager: &PgSessionManager, id: &str) -> Option<i64> {
    sqlx::query_scalar("SELECT value FROM rows WHERE id = $1")
        .bind(id)
        .fetch_optional(manager.pool())
        .await
        .expect("Failed to read row")
}

fn insert_row_executor() -> ContextExecutor<context_bus_postgres::PgSessionFactory> {
    ContextExecutor::on::<InsertRow>().handle_in_session(|_, event: InsertRow| async move {
        let scope = attached(&event.session)?;
        let mut session = scope.lock().await?;
        sqlx::query("INSERT INTO rows (id, value) VALUES ($1, $2)")
            .bind(&event.id)
            .bind(event.value)
            .execute(session.connection())
            .await?;

        if event.value < 0 {
            anyhow::bail!("negative value for {}", event.id);
        }
        Ok(Some(event.id))
    })
}

#[tokio::test]
async fn test_handler_success_commits() {
    let (_container, manager) = setup_manager().await;
    let bus = ContextBus::builder(manager.factory().expect("factory"))
        .with_executor(insert_row_executor())
        .build();

    bus.publish(InsertRow::new("committed", 7)).await;
    let capture = bus.gather().await.expect("drain succeeds");

    assert_eq!(capture.first::<String>().map(String::as_str), Some("committed"));
    assert_eq!(row_value(&manager, "committed").await, Some(7));
}

#[tokio::test]
async fn test_handler_failure_rolls_back() {
    let (_container, manager) = setup_manager().await;
    let bus = ContextBus::builder(manager.factory().expect("factory"))
        .with_executor(insert_row_executor())
        .build();

    bus.publish(InsertRow::new("rolled-back", -1)).await;
    let error = bus.gather().await.expect_err("handler fails");

    assert!(matches!(error, BusError::Handler { .. }));
    assert_eq!(row_value(&manager, "rolled-back").await, None);
}

#[tokio::test]
async fn test_concurrent_events_use_separate_transactions() {
    let (_container, manager) = setup_manager().await;
    let barrier = Arc::new(Barrier::new(2));

    let executor = ContextExecutor::on::<InsertRow>().handle_in_session(move |_, event: InsertRow| {
        let barrier = Arc::clone(&barrier);
        async move {
            let scope = attached(&event.session)?;
            let mut session = scope.lock().await?;
            sqlx::query("INSERT INTO rows (id, value) VALUES ($1, $2)")
                .bind(&event.id)
                .bind(event.value)
                .execute(&mut **session)
                .await?;

            // Both rows are inserted but neither transaction has committed.
            barrier.wait().await;

            let (visible,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rows")
                .fetch_one(session.connection())
                .await?;
            Ok::<_, anyhow::Error>(Some(visible))
        }
    });

    let bus = ContextBus::builder(manager.factory().expect("factory"))
        .with_executor(executor)
        .build();
    bus.publish(InsertRow::new("left", 1)).await;
    bus.publish(InsertRow::new("right", 2)).await;
    let capture = bus.gather().await.expect("drain succeeds");

    let visible: Vec<i64> = capture.get::<i64>().copied().collect();
    assert_eq!(visible, vec![1, 1]);
    assert_eq!(row_value(&manager, "left").await, Some(1));
    assert_eq!(row_value(&manager, "right").await, Some(2));
}

#[tokio::test]
async fn test_manager_close() {
    let (_container, manager) = setup_manager().await;
    let factory = manager.factory().expect("factory");
    assert!(!manager.is_closed());

    manager.close().await.expect("first close succeeds");

    assert!(manager.is_closed());
    assert!(matches!(manager.factory(), Err(PostgresError::Closed)));
    assert!(matches!(manager.close().await, Err(PostgresError::Closed)));

    let bus = ContextBus::builder(factory).with_executor(insert_row_executor()).build();
    bus.publish(InsertRow::new("after-close", 1)).await;
    assert!(matches!(bus.gather().await, Err(BusError::Session { .. })));
}
