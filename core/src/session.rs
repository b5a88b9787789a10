//! Transactional session scoping for persistence events.
//!
//! The bus does not know how sessions map onto a concrete store. It only needs a
//! [`SessionFactory`] that hands out an isolated [`ScopedSession`] per persistence
//! event, and a way to finish that session once the handler is done.
//!
//! # Lifecycle
//!
//! ```text
//! begin() ──► SessionScope attached to the event ──► handler runs
//!                                                        │
//!                                  Ok ◄──────────────────┴──────────────────► Err
//!                                  │                                          │
//!                               commit()                                  rollback()
//! ```
//!
//! If the task is aborted or the handler panics, the session is dropped without
//! either call. Implementations of [`ScopedSession`] must discard uncommitted work
//! on drop (`sqlx::Transaction` already does).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

/// Boxed future returned by session operations.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// Errors that can occur while opening or finishing a session.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The factory cannot produce sessions at all
    #[error("Session factory unavailable: {0}")]
    Unavailable(String),

    /// Opening a new session failed
    #[error("Failed to begin session: {0}")]
    Begin(String),

    /// Committing the session failed
    #[error("Failed to commit session: {0}")]
    Commit(String),

    /// Rolling the session back failed
    #[error("Failed to roll back session: {0}")]
    Rollback(String),

    /// The scope was already committed or rolled back
    #[error("Session scope already finished")]
    Finished,

    /// A persistence event was used before a session was attached to it
    #[error("No session attached to the event")]
    Detached,
}

/// A session with "commit on success, roll back on failure" semantics.
///
/// Dropping a session without calling either method must leave the store as if
/// [`rollback`](Self::rollback) had been called.
pub trait ScopedSession: Send + 'static {
    /// Make the session's work durable and release it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Commit`] if the store rejects the commit.
    fn commit(self) -> SessionFuture<'static, ()>;

    /// Discard the session's work and release it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Rollback`] if the store fails to roll back.
    fn rollback(self) -> SessionFuture<'static, ()>;
}

/// Produces isolated sessions, one per persistence event.
///
/// The factory is an explicitly constructed dependency handed to the bus builder.
pub trait SessionFactory: Send + Sync + 'static {
    /// Session type handed to persistence handlers.
    type Session: ScopedSession;

    /// Open a new session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Begin`] or [`SessionError::Unavailable`] if no session
    /// can be opened.
    fn begin(&self) -> SessionFuture<'_, Self::Session>;
}

impl<F: SessionFactory> SessionFactory for Arc<F> {
    type Session = F::Session;

    fn begin(&self) -> SessionFuture<'_, Self::Session> {
        (**self).begin()
    }
}

/// Shared handle to one open session.
///
/// The bus keeps one clone to finish the session and attaches another to the
/// event. Handlers borrow the session through [`lock`](Self::lock).
pub struct SessionScope<S> {
    inner: Arc<Mutex<Option<S>>>,
}

impl<S> SessionScope<S> {
    /// Wrap an open session.
    #[must_use]
    pub fn new(session: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(session))),
        }
    }

    /// Borrow the session exclusively.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Finished`] if the scope was already committed or
    /// rolled back.
    pub async fn lock(&self) -> Result<MappedMutexGuard<'_, S>, SessionError> {
        let guard = self.inner.lock().await;
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| SessionError::Finished)
    }

    /// Whether the session is still open.
    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    async fn take(&self) -> Result<S, SessionError> {
        self.inner.lock().await.take().ok_or(SessionError::Finished)
    }
}

impl<S: ScopedSession> SessionScope<S> {
    /// Commit the session. Later calls fail with [`SessionError::Finished`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Finished`] if the scope is already finished, or the
    /// session's own commit error.
    pub async fn commit(&self) -> Result<(), SessionError> {
        self.take().await?.commit().await
    }

    /// Roll the session back. Later calls fail with [`SessionError::Finished`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Finished`] if the scope is already finished, or the
    /// session's own rollback error.
    pub async fn rollback(&self) -> Result<(), SessionError> {
        self.take().await?.rollback().await
    }
}

impl<S> Clone for SessionScope<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> fmt::Debug for SessionScope<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionScope")
            .field("session", &std::any::type_name::<S>())
            .finish_non_exhaustive()
    }
}

/// A field that can hold an attached session scope.
///
/// `#[derive(PersistenceEvent)]` uses this to find the session type from the
/// type of the field marked `#[session]`.
pub trait SessionSlot {
    /// Session type stored in the slot.
    type Session;

    /// Store a scope in the slot, replacing any previous one.
    fn fill(&mut self, scope: SessionScope<Self::Session>);

    /// The attached scope, if any.
    fn scope(&self) -> Option<&SessionScope<Self::Session>>;
}

impl<S> SessionSlot for Option<SessionScope<S>> {
    type Session = S;

    fn fill(&mut self, scope: SessionScope<S>) {
        *self = Some(scope);
    }

    fn scope(&self) -> Option<&SessionScope<S>> {
        self.as_ref()
    }
}

/// Look up the scope attached to a slot.
///
/// # Errors
///
/// Returns [`SessionError::Detached`] if nothing was attached, which means the
/// event reached its handler without going through the bus.
pub fn attached<T: SessionSlot>(slot: &T) -> Result<&SessionScope<T::Session>, SessionError> {
    slot.scope().ok_or(SessionError::Detached)
}

/// Session factory for buses that never publish persistence events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSessions;

/// Session type of [`NoSessions`]. It has no values.
#[derive(Debug)]
pub enum NoSession {}

impl ScopedSession for NoSession {
    fn commit(self) -> SessionFuture<'static, ()> {
        match self {}
    }

    fn rollback(self) -> SessionFuture<'static, ()> {
        match self {}
    }
}

impl SessionFactory for NoSessions {
    type Session = NoSession;

    fn begin(&self) -> SessionFuture<'_, Self::Session> {
        Box::pin(async {
            Err(SessionError::Unavailable(
                "bus was built without a session factory".to_string(),
            ))
        })
    }
}
