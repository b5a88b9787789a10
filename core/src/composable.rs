//! Result reduction into caller-defined responses.
//!
//! A [`Composable`] owns an accumulator (typically a response object) and a table
//! of reducers keyed by result type. [`Composable::reduce`] walks a flattened
//! sequence of [`ResultBox`]es once and hands every value whose runtime type has a
//! reducer to that reducer.
//!
//! The composable knows nothing about events, sessions or concurrency. It matches
//! exact types only: a reducer for `T` never sees a wrapper or a value that merely
//! contains a `T`. Values without a reducer are skipped.
//!
//! # Example
//!
//! ```
//! use context_bus_core::capture::ResultBox;
//! use context_bus_core::composable::{Composable, set_key};
//! use serde_json::{Map, Value, json};
//!
//! struct CartLoaded {
//!     items: u32,
//! }
//!
//! let mut composable = Composable::new(Map::new());
//! composable.reducer(|response: &mut Map<String, Value>, cart: CartLoaded| {
//!     set_key(response, "items", cart.items);
//! });
//!
//! let response = composable.reduce(vec![
//!     ResultBox::new(CartLoaded { items: 2 }),
//!     ResultBox::new("ignored"),
//! ]);
//!
//! assert_eq!(Value::Object(response), json!({ "items": 2 }));
//! ```

use crate::capture::ResultBox;
use serde_json::{Map, Value};
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;

/// Type-erased reducer stored in the table.
type ErasedReducer<C> = Box<dyn FnMut(&mut C, Box<dyn Any + Send>) + Send>;

/// Folds typed results into an accumulator.
///
/// # Type Parameters
///
/// - `C`: The accumulator (response) type
pub struct Composable<C> {
    root: C,
    reducers: HashMap<TypeId, (&'static str, ErasedReducer<C>)>,
}

impl<C> Composable<C> {
    /// Start composing into `root`.
    #[must_use]
    pub fn new(root: C) -> Self {
        Self {
            root,
            reducers: HashMap::new(),
        }
    }

    /// Register the reducer for values of type `T`.
    ///
    /// Registering a second reducer for the same `T` replaces the first.
    pub fn reducer<T, F>(&mut self, mut reducer: F) -> &mut Self
    where
        C: 'static,
        T: Send + 'static,
        F: FnMut(&mut C, T) + Send + 'static,
    {
        let erased: ErasedReducer<C> = Box::new(move |root: &mut C, value: Box<dyn Any + Send>| {
            if let Ok(value) = value.downcast::<T>() {
                reducer(root, *value);
            }
        });
        self.reducers
            .insert(TypeId::of::<T>(), (type_name::<T>(), erased));
        self
    }

    /// Builder form of [`reducer`](Self::reducer).
    #[must_use]
    pub fn with_reducer<T, F>(mut self, reducer: F) -> Self
    where
        C: 'static,
        T: Send + 'static,
        F: FnMut(&mut C, T) + Send + 'static,
    {
        self.reducer(reducer);
        self
    }

    /// Whether a reducer is registered for `T`.
    #[must_use]
    pub fn handles<T: 'static>(&self) -> bool {
        self.reducers.contains_key(&TypeId::of::<T>())
    }

    /// Run every value through its reducer, in order, and return the accumulator.
    ///
    /// Each reducer runs once per matching value. Values with no registered
    /// reducer are ignored.
    pub fn reduce(mut self, items: impl IntoIterator<Item = ResultBox>) -> C {
        for item in items {
            if let Some((_, reducer)) = self.reducers.get_mut(&item.value_type_id()) {
                reducer(&mut self.root, item.into_inner());
            }
        }
        self.root
    }
}

impl<C: fmt::Debug> fmt::Debug for Composable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handled: Vec<&str> = self.reducers.values().map(|(name, _)| *name).collect();
        f.debug_struct("Composable")
            .field("root", &self.root)
            .field("reducers", &handled)
            .finish()
    }
}

/// Set `key` on a JSON object accumulator.
pub fn set_key(target: &mut Map<String, Value>, key: impl Into<String>, value: impl Into<Value>) {
    target.insert(key.into(), value.into());
}
