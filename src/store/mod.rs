//! Key-value store capabilities the cart protocol is built on.
//!
//! [`CartStore`] is the narrow command set the coordinator and reader need:
//! plain and conditional `SET` with expiry, `GET`, `DEL`, a list used as a
//! wake-up queue, an atomic batch, and a batch guarded by a key's value.
//! [`keydb::KeyDbStore`] talks to a real KeyDB/Redis; [`memory::MemoryStore`]
//! emulates the same semantics in-process.

pub mod keydb;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use keydb::KeyDbStore;
pub use memory::MemoryStore;

/// One command inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// `SET key value PX ttl`
    Set {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    /// `DEL key`
    Delete { key: String },
    /// `LPUSH key value`
    Push { key: String, value: String },
    /// `PEXPIRE key ttl`
    Expire { key: String, ttl: Duration },
}

/// Outcome of each command in a batch, in submission order.
pub type BatchResults = Vec<Result<(), StoreError>>;

#[async_trait]
pub trait CartStore: Send + Sync {
    /// `GET`.  `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// `SET key value PX ttl`.
    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<(), StoreError>;

    /// `SET key value NX PX ttl`.  Returns `true` if this call created the key.
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// `DEL`.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// `BLPOP key timeout`.  Blocks until an element is available or
    /// `timeout` elapses, in which case `Ok(None)` is returned.
    async fn blocking_pop(&self, key: &str, timeout: Duration)
        -> Result<Option<String>, StoreError>;

    /// `LPUSH`.
    async fn push(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// `PEXPIRE`.  Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Run `ops` as one atomic unit (MULTI/EXEC).
    ///
    /// The outer error means the batch as a whole failed.  Otherwise one
    /// result per op is returned; other ops are still applied when one of
    /// them errors, matching Redis transaction semantics.
    async fn execute_batch(&self, ops: Vec<BatchOp>) -> Result<BatchResults, StoreError>;

    /// Run `ops` atomically, but only while `guard_key` holds `expected`.
    ///
    /// Returns `Ok(false)` without touching anything when the guard key is
    /// missing or holds another value.  Unlike [`CartStore::execute_batch`]
    /// the first failing op aborts the rest and is returned as the error.
    async fn execute_if_equals(
        &self,
        guard_key: &str,
        expected: &str,
        ops: Vec<BatchOp>,
    ) -> Result<bool, StoreError>;

    /// Connectivity check.
    async fn ping(&self) -> Result<(), StoreError>;
}
