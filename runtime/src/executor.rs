//! Executor bindings.
//!
//! A [`ContextExecutor`] binds one event type to one async handler. Bindings are
//! built through [`ContextExecutor::on`]:
//!
//! ```ignore
//! // Plain event: the handler gets the payload as published.
//! ContextExecutor::on::<ProductRequested>().handle(|_bus, event| async move {
//!     Ok::<_, CatalogError>(Some(catalog.find(&event.product_id)?))
//! });
//!
//! // Persistence event: the handler runs inside its own session.
//! ContextExecutor::on::<GetUserCart>().handle_in_session(|_bus, event| async move {
//!     let scope = attached(&event.session)?;
//!     let mut session = scope.lock().await?;
//!     Ok::<_, anyhow::Error>(Some(session.find_cart(event.user_id).await?))
//! });
//! ```
//!
//! The handler receives a clone of the bus so it can publish follow-up events.
//! Returning `Ok(None)` contributes nothing to the drain's results.

use crate::bus::ContextBus;
use crate::error::BusError;
use crate::metrics::BusMetrics;
use context_bus_core::capture::ResultBox;
use context_bus_core::event::{ContextEvent, EventKey, PersistenceEvent};
use context_bus_core::session::{NoSessions, SessionFactory, SessionScope};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::Instrument;

/// Output of one handler invocation, boxed for storage in a batch.
pub(crate) type TaskOutput = Result<Option<ResultBox>, BusError>;

type TaskFuture = Pin<Box<dyn Future<Output = TaskOutput> + Send>>;

/// Type-erased handler entry point.
///
/// Returns `None` when the event is not of the bound type.
type StartFn<F> = dyn Fn(ContextBus<F>, &dyn Any) -> Option<TaskFuture> + Send + Sync;

/// One (event type → handler) binding.
///
/// Cloning is cheap; the same binding can be registered on several buses.
pub struct ContextExecutor<F: SessionFactory = NoSessions> {
    event: EventKey,
    in_session: bool,
    start: Arc<StartFn<F>>,
}

impl<F: SessionFactory> ContextExecutor<F> {
    /// Start building a binding for event type `E`.
    #[must_use]
    pub const fn on<E: ContextEvent>() -> ExecutorBuilder<E, F> {
        ExecutorBuilder {
            _marker: PhantomData,
        }
    }

    /// The event type this binding reacts to.
    #[must_use]
    pub const fn event(&self) -> EventKey {
        self.event
    }

    /// Whether invocations run inside their own session.
    #[must_use]
    pub const fn in_session(&self) -> bool {
        self.in_session
    }

    /// Spawn the handler for `event`.
    ///
    /// Returns `None` if `event` is not of the bound type.
    pub(crate) fn start(&self, bus: &ContextBus<F>, event: &dyn Any) -> Option<TaskRecord> {
        let task = (self.start)(bus.clone(), event)?;
        let span = tracing::debug_span!(
            "context_executor",
            event = %self.event,
            in_session = self.in_session
        );
        let handle = tokio::spawn(task.instrument(span));

        Some(TaskRecord {
            event: self.event,
            handle,
        })
    }
}

impl<F: SessionFactory> Clone for ContextExecutor<F> {
    fn clone(&self) -> Self {
        Self {
            event: self.event,
            in_session: self.in_session,
            start: Arc::clone(&self.start),
        }
    }
}

impl<F: SessionFactory> fmt::Debug for ContextExecutor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextExecutor")
            .field("event", &self.event)
            .field("in_session", &self.in_session)
            .finish_non_exhaustive()
    }
}

/// Builder returned by [`ContextExecutor::on`].
///
/// Picks how the handler for `E` is invoked.
pub struct ExecutorBuilder<E, F> {
    _marker: PhantomData<fn() -> (E, F)>,
}

impl<E: ContextEvent, F: SessionFactory> ExecutorBuilder<E, F> {
    /// Bind a handler invoked with the event's payload.
    #[must_use]
    pub fn handle<H, Fut, R, Err>(self, handler: H) -> ContextExecutor<F>
    where
        H: Fn(ContextBus<F>, E::Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>, Err>> + Send + 'static,
        R: Send + 'static,
        Err: Into<anyhow::Error> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let start = move |bus: ContextBus<F>, event: &dyn Any| -> Option<TaskFuture> {
            let event = event.downcast_ref::<E>()?.clone();
            let handler = Arc::clone(&handler);

            Some(Box::pin(async move {
                handler(bus, event.into_payload())
                    .await
                    .map(|output| output.map(ResultBox::new))
                    .map_err(|source| handler_failure::<E>(source.into()))
            }))
        };

        ContextExecutor {
            event: EventKey::of::<E>(),
            in_session: false,
            start: Arc::new(start),
        }
    }

    /// Bind a handler that runs inside a fresh session.
    ///
    /// Each invocation begins its own session from the bus's factory and attaches
    /// it to a private copy of the event before the handler sees the payload.
    /// The session commits when the handler returns `Ok` and rolls back when it
    /// returns `Err`. If the task is aborted or panics the session is dropped
    /// unfinished, which discards its work.
    ///
    /// Only events implementing `PersistenceEvent` for the factory's session type
    /// can be bound this way.
    #[must_use]
    pub fn handle_in_session<H, Fut, R, Err>(self, handler: H) -> ContextExecutor<F>
    where
        E: PersistenceEvent<F::Session>,
        H: Fn(ContextBus<F>, E::Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<R>, Err>> + Send + 'static,
        R: Send + 'static,
        Err: Into<anyhow::Error> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let start = move |bus: ContextBus<F>, event: &dyn Any| -> Option<TaskFuture> {
            let mut event = event.downcast_ref::<E>()?.clone();
            let handler = Arc::clone(&handler);

            Some(Box::pin(async move {
                let name = EventKey::of::<E>().name();
                let session = bus
                    .sessions()
                    .begin()
                    .await
                    .map_err(|source| BusError::Session {
                        event: name,
                        source,
                    })?;
                let scope = SessionScope::new(session);
                event.attach_session(scope.clone());
                tracing::trace!("Session opened");

                let outcome = handler(bus, event.into_payload())
                    .await
                    .map_err(|source| handler_failure::<E>(source.into()));

                match outcome {
                    Ok(output) => {
                        scope.commit().await.map_err(|source| BusError::Session {
                            event: name,
                            source,
                        })?;
                        BusMetrics::record_commit();
                        tracing::trace!("Session committed");
                        Ok(output.map(ResultBox::new))
                    }
                    Err(error) => {
                        match scope.rollback().await {
                            Ok(()) => {
                                BusMetrics::record_rollback();
                                tracing::debug!(error = %error, "Session rolled back");
                            }
                            Err(rollback) => {
                                tracing::error!(
                                    error = %error,
                                    rollback_error = %rollback,
                                    "Session rollback failed"
                                );
                            }
                        }
                        Err(error)
                    }
                }
            }))
        };

        ContextExecutor {
            event: EventKey::of::<E>(),
            in_session: true,
            start: Arc::new(start),
        }
    }
}

fn handler_failure<E: 'static>(source: anyhow::Error) -> BusError {
    BusError::Handler {
        event: EventKey::of::<E>().name(),
        source,
    }
}

/// A started handler invocation.
///
/// Owned by the batch it was started in until the batch is drained or
/// abandoned.
#[derive(Debug)]
pub struct TaskRecord {
    event: EventKey,
    handle: JoinHandle<TaskOutput>,
}

impl TaskRecord {
    /// The event type this task handles.
    #[must_use]
    pub const fn event(&self) -> EventKey {
        self.event
    }

    /// Whether the task has finished (successfully or not).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request cancellation of the task.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub(crate) fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Wait for the task and flatten join failures into [`BusError`].
    pub(crate) async fn join(self) -> TaskOutput {
        match self.handle.await {
            Ok(output) => output,
            Err(source) => Err(BusError::TaskJoin {
                event: self.event.name(),
                source,
            }),
        }
    }
}
