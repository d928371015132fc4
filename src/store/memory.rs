//! In-process [`CartStore`] with Redis semantics.
//!
//! Keys carry optional millisecond TTLs (checked lazily on access), string
//! and list values are distinct types (`WRONGTYPE` on mismatch), `BLPOP`
//! parks on a [`tokio::sync::Notify`] until a push, and a batch (guarded or
//! not) is applied under a single lock so no reader observes it half-done.  Cloning the
//! store shares the underlying keyspace, which is how tests model several
//! processes talking to one server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{BatchOp, BatchResults, CartStore};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    /// Live entry for `key`; an expired entry is dropped on the way.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.live(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::List(_)) => Err(wrong_type(key)),
        }
    }

    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn set_if_absent(&mut self, key: &str, value: &str, ttl: Duration) -> bool {
        if self.live(key).is_some() {
            return false;
        }
        self.set(key, value.as_bytes().to_vec(), ttl);
        true
    }

    fn delete(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn push(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        match self.live(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                list.push_front(value.to_string());
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::List(VecDeque::from([value.to_string()])),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// `LPOP`.  An emptied list disappears, as in Redis.
    fn pop(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let popped = match self.live(key) {
            None => return Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => (list.pop_front(), list.is_empty()),
            Some(_) => return Err(wrong_type(key)),
        };
        if popped.1 {
            self.entries.remove(key);
        }
        Ok(popped.0)
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    fn apply(&mut self, op: BatchOp) -> Result<(), StoreError> {
        match op {
            BatchOp::Set { key, value, ttl } => {
                self.set(&key, value, ttl);
                Ok(())
            }
            BatchOp::Delete { key } => {
                self.delete(&key);
                Ok(())
            }
            BatchOp::Push { key, value } => self.push(&key, &value),
            BatchOp::Expire { key, ttl } => {
                self.expire(&key, ttl);
                Ok(())
            }
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    pushed: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently exists (and has not expired).
    pub fn contains_key(&self, key: &str) -> bool {
        self.keyspace.lock().live(key).is_some()
    }

    /// Remaining TTL of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.keyspace
            .lock()
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of elements in the list at `key`; zero if absent.
    pub fn list_len(&self, key: &str) -> usize {
        match self.keyspace.lock().live(key).map(|e| &e.value) {
            Some(Value::List(list)) => list.len(),
            _ => 0,
        }
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.keyspace.lock().get(key)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.keyspace.lock().set(key, value.to_vec(), ttl);
        Ok(())
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self.keyspace.lock().set_if_absent(key, value, ttl))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.keyspace.lock().delete(key);
        Ok(())
    }

    async fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for the wake-up before checking the list so a push
            // landing between the check and the await is not missed.
            let pushed = self.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(token) = self.keyspace.lock().pop(key)? {
                return Ok(Some(token));
            }

            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.keyspace.lock().push(key, value)?;
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        Ok(self.keyspace.lock().expire(key, ttl))
    }

    async fn execute_batch(&self, ops: Vec<BatchOp>) -> Result<BatchResults, StoreError> {
        let pushes = ops.iter().any(|op| matches!(op, BatchOp::Push { .. }));
        let results = {
            let mut keyspace = self.keyspace.lock();
            ops.into_iter().map(|op| keyspace.apply(op)).collect()
        };
        if pushes {
            self.pushed.notify_waiters();
        }
        Ok(results)
    }

    async fn execute_if_equals(
        &self,
        guard_key: &str,
        expected: &str,
        ops: Vec<BatchOp>,
    ) -> Result<bool, StoreError> {
        let pushes = ops.iter().any(|op| matches!(op, BatchOp::Push { .. }));
        let applied = {
            let mut keyspace = self.keyspace.lock();
            if keyspace.get(guard_key)?.as_deref() != Some(expected.as_bytes()) {
                return Ok(false);
            }
            ops.into_iter().try_for_each(|op| keyspace.apply(op))
        };
        if pushes {
            self.pushed.notify_waiters();
        }
        applied.map(|()| true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
