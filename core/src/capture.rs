//! Captured handler results.
//!
//! A [`ResultBox`] wraps one completed handler's return value without knowing its
//! type. A [`ResultCapture`] groups boxes by the event type whose handlers produced
//! them, in the order those event types were first seen.
//!
//! # Ordering
//!
//! [`ResultCapture::flatten`] yields values grouped by event type (first-seen order),
//! then in the order they were captured under that type. For a fixed publish
//! sequence the order is the same on every run.

use crate::event::EventKey;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors from typed lookups on a [`ResultCapture`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// No captured value has the requested type
    #[error("No result of type {0} was captured")]
    Missing(&'static str),
}

/// A type-erased handler result.
pub struct ResultBox {
    value: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl ResultBox {
    /// Box a value.
    #[must_use]
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Runtime type of the boxed value.
    #[must_use]
    pub fn value_type_id(&self) -> TypeId {
        (*self.value).type_id()
    }

    /// Type name of the boxed value, for diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the boxed value is exactly a `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Borrow the value as `T`.
    #[must_use]
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the value out as `T`.
    ///
    /// # Errors
    ///
    /// Returns the box unchanged if the value is not a `T`.
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        let type_name = self.type_name;
        self.value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|value| Self { value, type_name })
    }

    /// Unwrap into the raw boxed value.
    #[must_use]
    pub fn into_inner(self) -> Box<dyn Any + Send> {
        self.value
    }
}

impl fmt::Debug for ResultBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResultBox").field(&self.type_name).finish()
    }
}

/// Results of one drain, grouped by the event type that produced them.
#[derive(Default)]
pub struct ResultCapture {
    order: Vec<EventKey>,
    items: HashMap<EventKey, Vec<ResultBox>>,
}

impl ResultCapture {
    /// An empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` without adding a value.
    ///
    /// Fixes the position of `key` in flatten order even if its handlers
    /// produce nothing.
    pub fn touch(&mut self, key: EventKey) {
        if !self.items.contains_key(&key) {
            self.order.push(key);
            self.items.insert(key, Vec::new());
        }
    }

    /// Append a value under `key`.
    pub fn push(&mut self, key: EventKey, value: ResultBox) {
        self.touch(key);
        if let Some(values) = self.items.get_mut(&key) {
            values.push(value);
        }
    }

    /// Append several values under `key`, keeping their order.
    pub fn extend(&mut self, key: EventKey, values: impl IntoIterator<Item = ResultBox>) {
        self.touch(key);
        if let Some(existing) = self.items.get_mut(&key) {
            existing.extend(values);
        }
    }

    /// Values captured for the event type `E`.
    #[must_use]
    pub fn for_event<E: 'static>(&self) -> &[ResultBox] {
        self.for_key(&EventKey::of::<E>())
    }

    /// Values captured under `key`.
    #[must_use]
    pub fn for_key(&self, key: &EventKey) -> &[ResultBox] {
        self.items.get(key).map_or(&[], Vec::as_slice)
    }

    /// Event types seen, in first-seen order.
    #[must_use]
    pub fn keys(&self) -> &[EventKey] {
        &self.order
    }

    /// Total number of captured values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    /// Whether nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over every value in flatten order without consuming the capture.
    pub fn iter(&self) -> impl Iterator<Item = &ResultBox> {
        self.order
            .iter()
            .filter_map(|key| self.items.get(key))
            .flat_map(|values| values.iter())
    }

    /// Every captured value of type `T`, in flatten order.
    pub fn get<T: 'static>(&self) -> impl Iterator<Item = &T> {
        self.iter().filter_map(ResultBox::value::<T>)
    }

    /// The first captured value of type `T`.
    #[must_use]
    pub fn first<T: 'static>(&self) -> Option<&T> {
        self.get::<T>().next()
    }

    /// The first captured value of type `T`, treating absence as an error.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Missing`] if no value of type `T` was captured.
    pub fn require<T: 'static>(&self) -> Result<&T, CaptureError> {
        self.first::<T>()
            .ok_or(CaptureError::Missing(type_name::<T>()))
    }

    /// Consume the capture into one ordered sequence.
    #[must_use]
    pub fn flatten(mut self) -> Vec<ResultBox> {
        let mut flattened = Vec::with_capacity(self.len());
        for key in &self.order {
            if let Some(values) = self.items.remove(key) {
                flattened.extend(values);
            }
        }
        flattened
    }
}

impl fmt::Debug for ResultCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for key in &self.order {
            map.entry(key, &self.for_key(key));
        }
        map.finish()
    }
}

impl IntoIterator for ResultCapture {
    type Item = ResultBox;
    type IntoIter = std::vec::IntoIter<ResultBox>;

    fn into_iter(self) -> Self::IntoIter {
        self.flatten().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Created;
    struct Read;

    #[derive(Debug, PartialEq)]
    struct CartLoaded(u32);

    #[test]
    fn box_downcasts_to_exact_type() {
        let boxed = ResultBox::new(CartLoaded(3));
        assert!(boxed.is::<CartLoaded>());
        assert!(!boxed.is::<u32>());
        assert_eq!(boxed.value::<CartLoaded>(), Some(&CartLoaded(3)));
        assert_eq!(boxed.value_type_id(), TypeId::of::<CartLoaded>());

        let boxed = match boxed.downcast::<u32>() {
            Ok(_) => unreachable!("CartLoaded is not a u32"),
            Err(original) => original,
        };
        assert_eq!(boxed.downcast::<CartLoaded>().ok(), Some(CartLoaded(3)));
    }

    #[test]
    fn flatten_groups_by_first_seen_event() {
        let mut capture = ResultCapture::new();
        capture.push(EventKey::of::<Read>(), ResultBox::new(10_u32));
        capture.push(EventKey::of::<Created>(), ResultBox::new(1_u32));
        capture.push(EventKey::of::<Read>(), ResultBox::new(11_u32));
        capture.push(EventKey::of::<Created>(), ResultBox::new(2_u32));

        let values: Vec<u32> = capture
            .flatten()
            .into_iter()
            .filter_map(|b| b.downcast::<u32>().ok())
            .collect();
        assert_eq!(values, vec![10, 11, 1, 2]);
    }

    #[test]
    fn touched_keys_keep_their_position() {
        let mut capture = ResultCapture::new();
        capture.touch(EventKey::of::<Created>());
        capture.push(EventKey::of::<Read>(), ResultBox::new("read"));

        assert_eq!(
            capture.keys(),
            &[EventKey::of::<Created>(), EventKey::of::<Read>()]
        );
        assert!(capture.for_event::<Created>().is_empty());
        assert_eq!(capture.len(), 1);
    }

    #[test]
    fn typed_lookups_span_event_types() {
        let mut capture = ResultCapture::new();
        capture.push(EventKey::of::<Created>(), ResultBox::new(CartLoaded(1)));
        capture.push(EventKey::of::<Read>(), ResultBox::new("unrelated"));
        capture.push(EventKey::of::<Read>(), ResultBox::new(CartLoaded(2)));

        let carts: Vec<&CartLoaded> = capture.get::<CartLoaded>().collect();
        assert_eq!(carts, vec![&CartLoaded(1), &CartLoaded(2)]);
        assert_eq!(capture.first::<CartLoaded>(), Some(&CartLoaded(1)));
        assert_eq!(capture.require::<&str>(), Ok(&"unrelated"));
    }

    #[test]
    fn require_fails_when_type_is_absent() {
        let capture = ResultCapture::new();
        assert!(capture.is_empty());
        assert!(matches!(
            capture.require::<CartLoaded>(),
            Err(CaptureError::Missing(name)) if name.ends_with("CartLoaded")
        ));
    }

    proptest! {
        #[test]
        fn flatten_keeps_per_key_order(values in proptest::collection::vec((any::<bool>(), any::<u32>()), 0..64)) {
            let mut capture = ResultCapture::new();
            for (is_read, value) in &values {
                if *is_read {
                    capture.push(EventKey::of::<Read>(), ResultBox::new(*value));
                } else {
                    capture.push(EventKey::of::<Created>(), ResultBox::new(*value));
                }
            }

            let first_is_read = values.first().map(|(is_read, _)| *is_read);
            let reads: Vec<u32> = values.iter().filter(|(r, _)| *r).map(|(_, v)| *v).collect();
            let creates: Vec<u32> = values.iter().filter(|(r, _)| !*r).map(|(_, v)| *v).collect();
            let expected: Vec<u32> = match first_is_read {
                Some(true) => reads.into_iter().chain(creates).collect(),
                _ => creates.into_iter().chain(reads).collect(),
            };

            let flattened: Vec<u32> = capture
                .flatten()
                .into_iter()
                .filter_map(|b| b.downcast::<u32>().ok())
                .collect();
            prop_assert_eq!(flattened, expected);
        }
    }
}
