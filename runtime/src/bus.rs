//! The Context Bus.
//!
//! # Drain model
//!
//! `publish` starts every handler bound to the event's type immediately and
//! queues the started tasks as one batch. `gather` then pops batches front to
//! back, awaiting each batch as a unit. Handlers may publish while they run, so
//! the queue can grow during a drain; `gather` only returns once it finds the
//! queue empty after the last batch completed.
//!
//! Results are grouped by the event type that produced them, in first-drained
//! order. Within a batch they follow executor registration order.
//!
//! # Failure
//!
//! The first failing task aborts its batch. Its siblings are cancelled, batches
//! still queued are abandoned, and the error is returned. Sessions already
//! committed by handlers that completed earlier stay committed; there is no
//! compensation.
//!
//! Abandoning a drain also advances the bus's frontier. Every handler receives a
//! bus handle stamped with the frontier it was started under, and events
//! published through a stale handle are dropped. A task that is still running
//! after its drain failed (an aborted task that has not reached its next yield
//! point, or any task when `abort_abandoned` is off) therefore cannot start new
//! work.

use crate::BusConfig;
use crate::error::BusError;
use crate::executor::{ContextExecutor, TaskRecord};
use crate::metrics::BusMetrics;
use context_bus_core::capture::{ResultBox, ResultCapture};
use context_bus_core::event::{ContextEvent, EventKey};
use context_bus_core::session::{NoSessions, SessionFactory};
use futures::future::try_join_all;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

/// Tasks started by one `publish` call.
///
/// Most events have one or two bindings, so the tasks are kept inline.
#[derive(Debug)]
pub struct Batch {
    event: EventKey,
    tasks: SmallVec<[TaskRecord; 4]>,
}

impl Batch {
    /// The event type that produced this batch.
    #[must_use]
    pub const fn event(&self) -> EventKey {
        self.event
    }

    /// The started tasks, in registration order.
    #[must_use]
    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Await every task, preserving order and failing fast.
    ///
    /// On the first failure the remaining tasks are aborted.
    async fn join(self) -> Result<Vec<ResultBox>, BusError> {
        let aborts: SmallVec<[AbortHandle; 4]> =
            self.tasks.iter().map(TaskRecord::abort_handle).collect();

        match try_join_all(self.tasks.into_iter().map(TaskRecord::join)).await {
            Ok(outputs) => Ok(outputs.into_iter().flatten().collect()),
            Err(error) => {
                for handle in &aborts {
                    handle.abort();
                }
                Err(error)
            }
        }
    }
}

struct BusState<F: SessionFactory> {
    executors: HashMap<EventKey, Vec<ContextExecutor<F>>>,
    pending: VecDeque<Batch>,
    /// Advanced each time a drain is abandoned
    frontier: u64,
}

struct BusInner<F: SessionFactory> {
    sessions: F,
    config: BusConfig,
    state: Mutex<BusState<F>>,
}

/// Request-scoped orchestrator for handler sagas.
///
/// Cheap to clone; clones share the registry and the pending queue. Handlers
/// receive a clone so they can publish follow-up events into the same drain.
///
/// Create one bus per request (or per unit of work). The bus holds no state
/// between drains other than its bindings.
pub struct ContextBus<F: SessionFactory = NoSessions> {
    inner: Arc<BusInner<F>>,
    /// Frontier of the drain that started the handler holding this handle.
    /// `None` for handles created by the caller.
    frontier: Option<u64>,
}

impl<F: SessionFactory> ContextBus<F> {
    /// Create a bus with no bindings and the default configuration.
    #[must_use]
    pub fn new(sessions: F) -> Self {
        Self::builder(sessions).build()
    }

    /// Start building a bus around a session factory.
    #[must_use]
    pub fn builder(sessions: F) -> ContextBusBuilder<F> {
        ContextBusBuilder {
            sessions,
            config: BusConfig::default(),
            executors: Vec::new(),
        }
    }

    /// The session factory persistence bindings draw from.
    #[must_use]
    pub fn sessions(&self) -> &F {
        &self.inner.sessions
    }

    /// The bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register a binding.
    ///
    /// Several bindings for the same event type all run, in registration order.
    #[tracing::instrument(skip_all, fields(event = %executor.event()))]
    pub async fn add_executor(&self, executor: ContextExecutor<F>) {
        tracing::debug!(in_session = executor.in_session(), "Registering executor");
        self.inner
            .state
            .lock()
            .await
            .executors
            .entry(executor.event())
            .or_default()
            .push(executor);
    }

    /// Register several bindings, in order.
    pub async fn add_executors(&self, executors: impl IntoIterator<Item = ContextExecutor<F>>) {
        for executor in executors {
            self.add_executor(executor).await;
        }
    }

    /// Number of bindings registered for event type `E`.
    pub async fn executor_count<E: ContextEvent>(&self) -> usize {
        self.inner
            .state
            .lock()
            .await
            .executors
            .get(&EventKey::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Start every handler bound to `E` and queue them as one batch.
    ///
    /// Returns once the tasks are started, without waiting for them. Publishing
    /// an event with no bindings is a no-op.
    #[tracing::instrument(skip_all, fields(event = %EventKey::of::<E>()))]
    pub async fn publish<E: ContextEvent>(&self, event: E) {
        let key = EventKey::of::<E>();
        let mut state = self.inner.state.lock().await;

        if self.frontier.is_some_and(|frontier| frontier != state.frontier) {
            tracing::trace!("Publisher belongs to an abandoned drain, dropping event");
            BusMetrics::record_dropped();
            return;
        }

        let Some(executors) = state.executors.get(&key) else {
            tracing::trace!("No executors bound, dropping event");
            BusMetrics::record_dropped();
            return;
        };

        let publisher = self.at_frontier(state.frontier);
        let tasks: SmallVec<[TaskRecord; 4]> = executors
            .iter()
            .filter_map(|executor| executor.start(&publisher, &event))
            .collect();

        tracing::debug!(tasks = tasks.len(), "Batch started");
        BusMetrics::record_publish(tasks.len());
        state.pending.push_back(Batch { event: key, tasks });
    }

    /// Number of batches waiting to be drained.
    pub async fn pending_batches(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    /// Drain every pending batch, including batches published during the drain.
    ///
    /// # Errors
    ///
    /// Returns the first task failure, or [`BusError::DrainLimitExceeded`] if more
    /// than `max_batches` batches were drained. Either way the remaining queue is
    /// abandoned and no partial results are returned.
    #[tracing::instrument(skip(self), name = "context_bus_gather")]
    pub async fn gather(&self) -> Result<ResultCapture, BusError> {
        let mut capture = ResultCapture::new();
        let mut drained = 0_usize;

        loop {
            let next = self.inner.state.lock().await.pending.pop_front();
            let Some(batch) = next else {
                break;
            };

            if drained >= self.inner.config.max_batches {
                let limit = self.inner.config.max_batches;
                tracing::warn!(limit, "Drain limit exceeded");
                batch.abort();
                self.abandon_pending().await;
                return Err(BusError::DrainLimitExceeded { limit });
            }
            drained += 1;

            let key = batch.event();
            let started = Instant::now();
            match batch.join().await {
                Ok(values) => {
                    let elapsed = started.elapsed();
                    BusMetrics::record_batch(elapsed);
                    if self
                        .inner
                        .config
                        .slow_batch_threshold
                        .is_some_and(|threshold| elapsed > threshold)
                    {
                        tracing::warn!(event = %key, ?elapsed, "Slow batch");
                    }
                    tracing::trace!(event = %key, results = values.len(), "Batch drained");
                    capture.extend(key, values);
                }
                Err(error) => {
                    tracing::warn!(event = %key, error = %error, "Batch failed, abandoning drain");
                    BusMetrics::record_failure();
                    self.abandon_pending().await;
                    return Err(error);
                }
            }
        }

        tracing::debug!(batches = drained, results = capture.len(), "Drain settled");
        Ok(capture)
    }

    /// Handle given to handlers started under `frontier`.
    fn at_frontier(&self, frontier: u64) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            frontier: Some(frontier),
        }
    }

    /// Close the current frontier and drop every queued batch, aborting its
    /// tasks unless configured otherwise.
    async fn abandon_pending(&self) {
        let abandoned: Vec<Batch> = {
            let mut state = self.inner.state.lock().await;
            state.frontier = state.frontier.wrapping_add(1);
            state.pending.drain(..).collect()
        };
        if abandoned.is_empty() {
            return;
        }

        tracing::warn!(batches = abandoned.len(), "Abandoning queued batches");
        if self.inner.config.abort_abandoned {
            for batch in &abandoned {
                batch.abort();
            }
        }
    }
}

impl ContextBus<NoSessions> {
    /// Create a bus for sagas with no persistence bindings.
    #[must_use]
    pub fn without_sessions() -> Self {
        Self::new(NoSessions)
    }
}

impl Default for ContextBus<NoSessions> {
    fn default() -> Self {
        Self::without_sessions()
    }
}

impl<F: SessionFactory> Clone for ContextBus<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            frontier: self.frontier,
        }
    }
}

impl<F: SessionFactory> fmt::Debug for ContextBus<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBus")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ContextBus`].
pub struct ContextBusBuilder<F: SessionFactory> {
    sessions: F,
    config: BusConfig,
    executors: Vec<ContextExecutor<F>>,
}

impl<F: SessionFactory> ContextBusBuilder<F> {
    /// Use a custom configuration.
    #[must_use]
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a binding.
    #[must_use]
    pub fn with_executor(mut self, executor: ContextExecutor<F>) -> Self {
        self.executors.push(executor);
        self
    }

    /// Register several bindings, in order.
    #[must_use]
    pub fn with_executors(mut self, executors: impl IntoIterator<Item = ContextExecutor<F>>) -> Self {
        self.executors.extend(executors);
        self
    }

    /// Build the bus.
    #[must_use]
    pub fn build(self) -> ContextBus<F> {
        let mut registry: HashMap<EventKey, Vec<ContextExecutor<F>>> = HashMap::new();
        for executor in self.executors {
            registry.entry(executor.event()).or_default().push(executor);
        }

        ContextBus {
            inner: Arc::new(BusInner {
                sessions: self.sessions,
                config: self.config,
                state: Mutex::new(BusState {
                    executors: registry,
                    pending: VecDeque::new(),
                    frontier: 0,
                }),
            }),
            frontier: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Debug)]
    struct Ping(u32);

    impl ContextEvent for Ping {
        type Payload = u32;

        fn into_payload(self) -> u32 {
            self.0
        }
    }

    #[derive(Clone, Debug)]
    struct Unbound;

    impl ContextEvent for Unbound {
        type Payload = Self;

        fn into_payload(self) -> Self {
            self
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[tokio::test]
    async fn test_publish_without_executors_is_noop() {
        let bus = ContextBus::without_sessions();

        bus.publish(Unbound).await;

        assert_eq!(bus.pending_batches().await, 0);
        let capture = bus.gather().await.unwrap();
        assert!(capture.is_empty());
    }

    #[tokio::test]
    async fn test_gather_on_empty_queue() {
        let bus = ContextBus::default();
        let capture = bus.gather().await.unwrap();
        assert!(capture.is_empty());
        assert!(capture.keys().is_empty());
    }

    #[tokio::test]
    async fn test_publish_queues_one_batch_per_event() {
        let bus = ContextBus::builder(NoSessions)
            .with_executor(ContextExecutor::on::<Ping>().handle(|_, n| async move {
                Ok::<_, Boom>(Some(n))
            }))
            .with_executor(ContextExecutor::on::<Ping>().handle(|_, n| async move {
                Ok::<_, Boom>(Some(n * 10))
            }))
            .build();

        bus.publish(Ping(1)).await;
        bus.publish(Ping(2)).await;

        assert_eq!(bus.executor_count::<Ping>().await, 2);
        assert_eq!(bus.pending_batches().await, 2);

        let capture = bus.gather().await.unwrap();
        let values: Vec<u32> = capture.get::<u32>().copied().collect();
        assert_eq!(values, vec![1, 10, 2, 20]);
        assert_eq!(bus.pending_batches().await, 0);
    }

    #[tokio::test]
    async fn test_none_results_are_dropped_but_key_recorded() {
        let bus = ContextBus::without_sessions();
        bus.add_executor(ContextExecutor::on::<Ping>().handle(|_, _| async move {
            Ok::<Option<u32>, Boom>(None)
        }))
        .await;

        bus.publish(Ping(7)).await;
        let capture = bus.gather().await.unwrap();

        assert!(capture.is_empty());
        assert_eq!(capture.keys(), &[EventKey::of::<Ping>()]);
    }

    #[tokio::test]
    async fn test_failure_returns_handler_error() {
        let bus = ContextBus::without_sessions();
        bus.add_executor(ContextExecutor::on::<Ping>().handle(|_, n| async move {
            Err::<Option<u32>, _>(Boom(n))
        }))
        .await;

        bus.publish(Ping(4)).await;
        let error = bus.gather().await.unwrap_err();

        assert_eq!(error.event(), Some(EventKey::of::<Ping>().name()));
        assert_eq!(error.downcast_ref::<Boom>().map(|b| b.0), Some(4));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_task_join_error() {
        let bus = ContextBus::without_sessions();
        bus.add_executor(ContextExecutor::on::<Ping>().handle(|_, n| async move {
            if n > 0 {
                panic!("handler panicked");
            }
            Ok::<Option<u32>, Boom>(None)
        }))
        .await;

        bus.publish(Ping(1)).await;
        let error = bus.gather().await.unwrap_err();

        assert!(matches!(error, BusError::TaskJoin { .. }));
    }

    #[tokio::test]
    async fn test_drain_limit() {
        let bus = ContextBus::builder(NoSessions)
            .with_config(BusConfig::default().with_max_batches(3))
            .with_executor(ContextExecutor::on::<Ping>().handle(|bus, n| async move {
                bus.publish(Ping(n + 1)).await;
                Ok::<_, Boom>(Some(n))
            }))
            .build();

        bus.publish(Ping(0)).await;
        let error = bus.gather().await.unwrap_err();

        assert!(matches!(error, BusError::DrainLimitExceeded { limit: 3 }));
        assert_eq!(bus.pending_batches().await, 0);
    }

    #[tokio::test]
    async fn test_abandoned_tasks_are_aborted() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);

        let bus = ContextBus::without_sessions();
        bus.add_executor(ContextExecutor::on::<Ping>().handle(move |_, n| {
            let counter = Arc::clone(&counter);
            async move {
                if n == 0 {
                    return Err(Boom(n));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(n))
            }
        }))
        .await;

        bus.publish(Ping(0)).await;
        bus.publish(Ping(1)).await;

        assert!(bus.gather().await.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(bus.pending_batches().await, 0);
    }

    #[tokio::test]
    async fn test_clones_share_queue() {
        let bus = ContextBus::without_sessions();
        let clone = bus.clone();
        clone
            .add_executor(ContextExecutor::on::<Ping>().handle(|_, n| async move {
                Ok::<_, Boom>(Some(n))
            }))
            .await;

        clone.publish(Ping(3)).await;

        assert_eq!(bus.pending_batches().await, 1);
        assert_eq!(bus.gather().await.unwrap().first::<u32>(), Some(&3));
    }
}
