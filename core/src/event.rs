//! Event traits and dispatch identity for the context bus.
//!
//! Events are inert records. The bus routes them by their *runtime type*, never by
//! their field values: two `CartRequested` events with different contents reach
//! the same executors.
//!
//! # Design
//!
//! - [`ContextEvent`] is the capability every published event has: it can be turned
//!   into the payload its handlers receive. Most events are their own payload.
//! - [`PersistenceEvent`] marks events whose handlers must run inside a freshly opened
//!   transactional session. The bus attaches the session to the event before the
//!   handler sees it.
//! - [`EventKey`] is the dispatch identity, built from [`TypeId`].
//!
//! Conformance is checked by the compiler. An event that cannot produce a payload,
//! or a persistence event without a session slot, does not implement the trait and
//! cannot be registered or published.
//!
//! # Example
//!
//! ```
//! use context_bus_core::event::{ContextEvent, EventKey};
//!
//! #[derive(Clone, Debug)]
//! struct ProductRequested {
//!     product_id: String,
//! }
//!
//! impl ContextEvent for ProductRequested {
//!     type Payload = Self;
//!
//!     fn into_payload(self) -> Self::Payload {
//!         self
//!     }
//! }
//!
//! let key = EventKey::of::<ProductRequested>();
//! assert!(key.name().ends_with("ProductRequested"));
//! ```

use crate::session::SessionScope;
use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

/// An event that can be published on a context bus.
///
/// Every bound executor receives its own copy of the event, so events must be
/// `Clone`. The copy is consumed by [`into_payload`](Self::into_payload) right before
/// the handler runs.
///
/// # Thread Safety
///
/// Handlers run as Tokio tasks, so events and payloads must be `Send + 'static`.
pub trait ContextEvent: Clone + Send + Sync + 'static {
    /// The value handed to handlers. Usually `Self`.
    type Payload: Send + 'static;

    /// Convert the event into the payload its handlers receive.
    fn into_payload(self) -> Self::Payload;
}

/// An event whose handlers need a live transactional session.
///
/// Before the handler runs the bus opens a new session scope from its
/// [`SessionFactory`](crate::session::SessionFactory) and calls
/// [`attach_session`](Self::attach_session) on that executor's copy of the event.
/// The scope is committed when the handler succeeds and rolled back when it fails.
///
/// `S` is the session type produced by the bus's session factory.
pub trait PersistenceEvent<S>: ContextEvent {
    /// Store the session scope on the event so the handler can reach it.
    fn attach_session(&mut self, scope: SessionScope<S>);
}

/// Dispatch identity of an event type.
///
/// Equality and hashing use the [`TypeId`] only. The type name is carried for logs
/// and error messages.
#[derive(Clone, Copy)]
pub struct EventKey {
    id: TypeId,
    name: &'static str,
}

impl EventKey {
    /// Key for the type `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The underlying type identifier.
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name, for diagnostics only.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this key identifies `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for EventKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventKey {}

impl Hash for EventKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventKey").field(&self.name).finish()
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
