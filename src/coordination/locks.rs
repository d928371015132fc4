//! Per-cart distributed lock with a wait-queue wake-up signal.
//!
//! Ownership is the existence of `cart:{id}:mutex`, taken with SET NX PX.
//! Callers that lose the race park on a BLPOP against `cart:{id}:wait`; the
//! releasing owner pushes a single token there.  A woken waiter does not
//! assume it owns the lock, it goes back to SET NX, so duplicate, stale or
//! spurious tokens are harmless.  The token list carries a short TTL so an
//! unconsumed wake-up does not linger.
//!
//! Each [`CartLock`] writes its own token into the mutex, and
//! [`CartLock::release`] only deletes a mutex that still holds that token.
//! A mutex that expired and was re-taken belongs to someone else.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{BatchOp, BatchResults, CartStore};

/// Value pushed onto the wait queue.  Its content is never inspected.
pub const NOTIFY_TOKEN: &str = "1";

pub fn mutex_key(cart_id: &str) -> String {
    format!("cart:{cart_id}:mutex")
}

pub fn wait_key(cart_id: &str) -> String {
    format!("cart:{cart_id}:wait")
}

/// First per-op error in a batch reply, if any.
pub fn first_error(results: BatchResults) -> Result<(), StoreError> {
    results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
}

pub struct CartLock<'a> {
    store: &'a dyn CartStore,
    mutex_key: String,
    wait_key: String,
    owner: &'a str,
    token: String,
}

impl<'a> CartLock<'a> {
    pub fn new(store: &'a dyn CartStore, cart_id: &str, owner: &'a str) -> Self {
        // Updaters in one process share `owner`; the nonce tells them apart.
        let token = format!(
            "{owner}:{}:{}",
            chrono::Utc::now().timestamp(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            store,
            mutex_key: mutex_key(cart_id),
            wait_key: wait_key(cart_id),
            owner,
            token,
        }
    }

    /// Value written into the mutex while this lock holds it:
    /// `{owner}:{unix_ts}:{nonce}`.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Attempt to take the lock with SET NX PX `ttl`.
    ///
    /// Returns `true` if the lock was acquired, `false` if someone else holds
    /// it.
    pub async fn try_acquire(&self, ttl: Duration) -> Result<bool, StoreError> {
        let acquired = self
            .store
            .set_if_absent_with_expiry(&self.mutex_key, &self.token, ttl)
            .await?;
        debug!(key = %self.mutex_key, owner = %self.owner, acquired, ?ttl, "try_acquire");
        Ok(acquired)
    }

    /// Block until a wake-up token arrives or `timeout` elapses.
    ///
    /// Returns `true` when woken.  Being woken is only a hint that the lock
    /// may be free.
    pub async fn wait_for_notification(&self, timeout: Duration) -> Result<bool, StoreError> {
        let token = self.store.blocking_pop(&self.wait_key, timeout).await?;
        debug!(key = %self.wait_key, woken = token.is_some(), "wait_for_notification");
        Ok(token.is_some())
    }

    /// Drop any wake-up token left behind by an earlier owner.
    pub async fn clear_stale_notifications(&self) -> Result<(), StoreError> {
        self.store.delete(&self.wait_key).await
    }

    /// Commands that hand the lock on: reset the wait queue to exactly one
    /// token with a short TTL, then delete the mutex.  The mutex delete comes
    /// last; it is the actual release.
    pub fn release_ops(&self, notify_ttl: Duration) -> Vec<BatchOp> {
        vec![
            BatchOp::Delete {
                key: self.wait_key.clone(),
            },
            BatchOp::Push {
                key: self.wait_key.clone(),
                value: NOTIFY_TOKEN.to_string(),
            },
            BatchOp::Expire {
                key: self.wait_key.clone(),
                ttl: notify_ttl,
            },
            BatchOp::Delete {
                key: self.mutex_key.clone(),
            },
        ]
    }

    /// Release the lock and wake one waiter, atomically and only if the
    /// mutex still holds this lock's token.
    ///
    /// Returns `false`, having changed nothing, when the mutex expired or
    /// has since been taken by another owner.
    pub async fn release(&self, notify_ttl: Duration) -> Result<bool, StoreError> {
        let released = self
            .store
            .execute_if_equals(&self.mutex_key, &self.token, self.release_ops(notify_ttl))
            .await?;
        if released {
            debug!(key = %self.mutex_key, owner = %self.owner, "lock released");
        } else {
            warn!(
                key = %self.mutex_key,
                owner = %self.owner,
                "lock release: mutex expired or owned by another caller"
            );
        }
        Ok(released)
    }
}
