//! In-memory transactional store for testing persistence handlers
//!
//! Provides deterministic session infrastructure without a database:
//! - [`InMemoryStore`]: Shared committed state, a JSON value per key
//! - [`InMemorySessionFactory`]: Opens sessions over the store and counts their outcomes
//! - [`InMemorySession`]: Private write-set, applied on commit and discarded otherwise

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use context_bus_core::session::{ScopedSession, SessionError, SessionFactory, SessionFuture};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Committed state shared by every session opened over it.
///
/// # Example
///
/// ```
/// use context_bus_testing::InMemoryStore;
/// use serde_json::json;
///
/// let store = InMemoryStore::new();
/// store.insert("cart:1", json!({ "items": [] }));
///
/// assert!(store.contains_key("cart:1"));
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write directly, bypassing sessions (for seeding test state)
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.data.write().unwrap().insert(key.into(), value);
    }

    /// Read the committed value for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().unwrap().get(key).cloned()
    }

    /// Check if a committed value exists for `key`
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    /// Number of committed keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Check if nothing is committed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Committed keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.read().unwrap().keys().cloned().collect()
    }

    /// Clear all committed state
    pub fn clear(&self) {
        self.data.write().unwrap().clear();
    }

    fn apply(&self, writes: HashMap<String, Option<Value>>) {
        let mut data = self.data.write().unwrap();
        for (key, value) in writes {
            match value {
                Some(value) => data.insert(key, value),
                None => data.remove(&key),
            };
        }
    }
}

/// Outcome counters for sessions opened by one factory
#[derive(Debug, Default)]
struct Counters {
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    rejected: AtomicUsize,
    discarded: AtomicUsize,
}

/// Snapshot of session outcomes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Sessions opened
    pub begun: usize,
    /// Sessions committed
    pub committed: usize,
    /// Sessions rolled back explicitly
    pub rolled_back: usize,
    /// Commits the store refused; their writes were discarded
    pub rejected: usize,
    /// Sessions dropped without commit or rollback
    pub discarded: usize,
}

impl SessionStats {
    /// Sessions that finished one way or another
    #[must_use]
    pub const fn finished(&self) -> usize {
        self.committed + self.rolled_back + self.rejected + self.discarded
    }
}

/// Session factory over an [`InMemoryStore`].
///
/// Clones share the store and the counters.
///
/// # Example
///
/// ```
/// use context_bus_core::session::{ScopedSession, SessionFactory};
/// use context_bus_testing::InMemorySessionFactory;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = InMemorySessionFactory::new();
///
/// let mut session = factory.begin().await?;
/// session.put("product:1", json!({ "name": "Lamp" }));
/// assert!(!factory.store().contains_key("product:1"));
///
/// session.commit().await?;
/// assert!(factory.store().contains_key("product:1"));
/// assert_eq!(factory.stats().committed, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySessionFactory {
    store: InMemoryStore,
    counters: Arc<Counters>,
    fail_begin: Arc<AtomicBool>,
    fail_commit: Arc<AtomicBool>,
}

impl InMemorySessionFactory {
    /// Create a factory over a fresh store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory over an existing store
    #[must_use]
    pub fn with_store(store: InMemoryStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// The committed state
    #[must_use]
    pub const fn store(&self) -> &InMemoryStore {
        &self.store
    }

    /// Snapshot of session outcomes so far
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            begun: self.counters.begun.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            rolled_back: self.counters.rolled_back.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            discarded: self.counters.discarded.load(Ordering::SeqCst),
        }
    }

    /// Make subsequent `begin` calls fail with [`SessionError::Unavailable`]
    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent commits fail with [`SessionError::Commit`]
    ///
    /// A failed commit discards the session's writes.
    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }
}

impl SessionFactory for InMemorySessionFactory {
    type Session = InMemorySession;

    fn begin(&self) -> SessionFuture<'_, InMemorySession> {
        Box::pin(async move {
            if self.fail_begin.load(Ordering::SeqCst) {
                return Err(SessionError::Unavailable(
                    "in-memory store refused new sessions".to_string(),
                ));
            }
            self.counters.begun.fetch_add(1, Ordering::SeqCst);
            Ok(InMemorySession {
                store: self.store.clone(),
                counters: Arc::clone(&self.counters),
                fail_commit: self.fail_commit.load(Ordering::SeqCst),
                writes: HashMap::new(),
                finished: false,
            })
        })
    }
}

/// One open session.
///
/// Reads see the session's own writes first, then committed state. Writes stay
/// private until [`commit`](ScopedSession::commit).
#[derive(Debug)]
pub struct InMemorySession {
    store: InMemoryStore,
    counters: Arc<Counters>,
    fail_commit: bool,
    writes: HashMap<String, Option<Value>>,
    finished: bool,
}

impl InMemorySession {
    /// Read `key` as this session sees it
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.writes.get(key) {
            Some(pending) => pending.clone(),
            None => self.store.get(key),
        }
    }

    /// Read and deserialize `key`
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value does not deserialize into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.get(key).map(serde_json::from_value).transpose()
    }

    /// Stage a write
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.writes.insert(key.into(), Some(value));
    }

    /// Serialize and stage a write
    ///
    /// # Errors
    ///
    /// Returns an error if `value` does not serialize.
    pub fn put_as<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.put(key, value);
        Ok(())
    }

    /// Stage a delete
    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.insert(key.into(), None);
    }

    /// Number of staged writes
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }
}

impl ScopedSession for InMemorySession {
    fn commit(mut self) -> SessionFuture<'static, ()> {
        self.finished = true;
        let writes = std::mem::take(&mut self.writes);

        if self.fail_commit {
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
            return Box::pin(async {
                Err(SessionError::Commit(
                    "in-memory store rejected the commit".to_string(),
                ))
            });
        }

        self.store.apply(writes);
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn rollback(mut self) -> SessionFuture<'static, ()> {
        self.finished = true;
        self.writes.clear();
        self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if !self.finished {
            self.counters.discarded.fetch_add(1, Ordering::SeqCst);
        }
    }
}
