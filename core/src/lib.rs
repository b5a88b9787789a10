//! # Context Bus Core
//!
//! Core traits and types for the Context Bus.
//!
//! This crate provides the building blocks an in-process saga runtime needs,
//! without the runtime itself:
//!
//! - **Events**: [`ContextEvent`] and the [`PersistenceEvent`] marker, routed by
//!   [`EventKey`] (runtime type identity)
//! - **Sessions**: [`SessionFactory`] / [`ScopedSession`], the consumed interface to
//!   whatever store backs persistence handlers
//! - **Result capture**: [`ResultBox`] and [`ResultCapture`], the grouped output of
//!   one drain
//! - **Composable**: [`Composable`], a bus-independent reducer that folds captured
//!   results into a response
//!
//! ## Example
//!
//! ```ignore
//! use context_bus_core::*;
//!
//! #[derive(Clone, Debug)]
//! struct CartRequested {
//!     user_id: Uuid,
//!     session: Option<SessionScope<PgSession>>,
//! }
//!
//! impl ContextEvent for CartRequested {
//!     type Payload = Self;
//!     fn into_payload(self) -> Self { self }
//! }
//!
//! impl PersistenceEvent<PgSession> for CartRequested {
//!     fn attach_session(&mut self, scope: SessionScope<PgSession>) {
//!         self.session = Some(scope);
//!     }
//! }
//!
//! // After bus.gather():
//! let response = Composable::new(serde_json::Map::new())
//!     .with_reducer(|resp, cart: CartLoaded| set_key(resp, "cart", cart.id.to_string()))
//!     .reduce(capture.flatten());
//! ```

pub mod capture;
pub mod composable;
pub mod event;
pub mod session;

// Re-export commonly used types
pub use capture::{CaptureError, ResultBox, ResultCapture};
pub use composable::{Composable, set_key};
pub use event::{ContextEvent, EventKey, PersistenceEvent};
pub use session::{
    NoSession, NoSessions, ScopedSession, SessionError, SessionFactory, SessionFuture,
    SessionScope, SessionSlot, attached,
};
