//! Coordinated read-modify-write of a cart.
//!
//! One [`CartUpdater::update`] call is one cycle:
//!
//! 1. SET NX PX the cart mutex, with the TTL set to the time left before the
//!    caller's deadline.  On contention, BLPOP the cart's wait queue until
//!    woken or out of time, then try again.
//! 2. Clear stale wake-up tokens, GET and decode the current cart (or start
//!    from the empty cart).
//! 3. Apply the caller's transform.
//! 4. In one MULTI/EXEC: write the cart with the retention TTL, reset the wait
//!    queue to a single short-lived token, and delete the mutex.
//!
//! Any failure after the mutex is held triggers a best-effort release under
//! its own small budget, since the caller's deadline may already be spent.
//! That release is conditional on the mutex still holding this cycle's
//! token: past the deadline the mutex has expired and may belong to the next
//! owner.  If the holder dies instead, the mutex expires on its own at the
//! deadline it was taken with.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cart_key;
use super::locks::{first_error, CartLock};
use crate::cart::{codec, Cart};
use crate::config::CartConfig;
use crate::context::RequestContext;
use crate::error::{CartError, StoreError};
use crate::metrics::{Outcome, OutcomeLabels, MetricsRegistry};
use crate::store::{BatchOp, CartStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdaterConfig {
    /// TTL written with every cart.
    pub cart_retention: Duration,
    /// TTL on the wait queue after a release pushes its wake-up token.
    pub notify_ttl: Duration,
    /// Budget for the best-effort release after a failed cycle.
    pub release_timeout: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            cart_retention: Duration::from_secs(5 * 60),
            notify_ttl: Duration::from_secs(1),
            release_timeout: Duration::from_millis(500),
        }
    }
}

impl From<&CartConfig> for UpdaterConfig {
    fn from(config: &CartConfig) -> Self {
        Self {
            cart_retention: Duration::from_secs(config.retention_secs),
            notify_ttl: Duration::from_millis(config.notify_ttl_ms),
            release_timeout: Duration::from_millis(config.release_timeout_ms),
        }
    }
}

#[derive(Clone)]
pub struct CartUpdater {
    store: Arc<dyn CartStore>,
    config: UpdaterConfig,
    owner: String,
    metrics: Option<MetricsRegistry>,
}

impl CartUpdater {
    pub fn new(store: Arc<dyn CartStore>) -> Self {
        Self {
            store,
            config: UpdaterConfig::default(),
            owner: super::node::node_id(),
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: UpdaterConfig) -> Self {
        self.config = config;
        self
    }

    /// Name written into the mutex while this updater holds it.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// Apply `transform` to the cart stored under `cart_id` and persist the
    /// result, with no other update to the same cart in between.
    ///
    /// `ctx` must carry a deadline; it bounds the lock wait, the lock's own
    /// TTL, and every store command of the cycle.  `transform` receives the
    /// current cart (empty if it was never written) and returns the cart to
    /// store.  It runs while the lock is held and should be quick; time spent
    /// in it comes out of the same deadline.  The stored cart always keeps
    /// `cart_id` as its id.
    pub async fn update<F>(
        &self,
        ctx: &RequestContext,
        cart_id: &str,
        transform: F,
    ) -> Result<Cart, CartError>
    where
        F: FnOnce(Cart) -> Cart + Send,
    {
        let started = Instant::now();
        let result = self.run_cycle(ctx, cart_id, transform).await;

        if let Some(registry) = &self.metrics {
            let outcome = Outcome::of(&result);
            registry
                .metrics
                .updates_total
                .get_or_create(&OutcomeLabels { outcome })
                .inc();
            registry
                .metrics
                .update_duration_seconds
                .observe(started.elapsed().as_secs_f64());
            if outcome == Outcome::LockTimeout {
                registry.metrics.lock_timeouts.inc();
            }
        }

        match &result {
            Ok(_) => debug!(%cart_id, elapsed = ?started.elapsed(), "cart updated"),
            Err(e) => warn!(%cart_id, error = %e, "cart update failed"),
        }
        result
    }

    async fn run_cycle<F>(
        &self,
        ctx: &RequestContext,
        cart_id: &str,
        transform: F,
    ) -> Result<Cart, CartError>
    where
        F: FnOnce(Cart) -> Cart + Send,
    {
        if ctx.deadline().is_none() {
            return Err(CartError::Configuration);
        }
        if cart_id.is_empty() {
            return Err(CartError::InvalidCartId);
        }

        let lock = CartLock::new(self.store.as_ref(), cart_id, &self.owner);
        self.acquire(ctx, &lock, cart_id).await?;

        if let Err(source) = ctx.bound(lock.clear_stale_notifications()).await {
            return Err(CartError::LockAcquisition {
                cart_id: cart_id.to_string(),
                source,
                release: self.release_after_failure(&lock, cart_id).await,
            });
        }

        let key = cart_key(cart_id);
        let current = match ctx.bound(self.store.get(&key)).await {
            Ok(None) => Cart::new(cart_id),
            Ok(Some(bytes)) => match codec::decode(cart_id, &bytes) {
                Ok(cart) => cart,
                Err(source) => {
                    return Err(CartError::Deserialization {
                        cart_id: cart_id.to_string(),
                        source,
                        release: self.release_after_failure(&lock, cart_id).await,
                    });
                }
            },
            Err(source) => {
                return Err(CartError::Read {
                    cart_id: cart_id.to_string(),
                    source,
                    release: self.release_after_failure(&lock, cart_id).await,
                });
            }
        };

        let mut updated = transform(current);
        updated.cart_id = cart_id.to_string();

        let committed = match codec::encode(&updated) {
            Ok(payload) => {
                let mut ops = vec![BatchOp::Set {
                    key,
                    value: payload,
                    ttl: self.config.cart_retention,
                }];
                ops.extend(lock.release_ops(self.config.notify_ttl));
                ctx.bound(self.store.execute_batch(ops))
                    .await
                    .and_then(first_error)
            }
            Err(e) => Err(StoreError::Backend(
                anyhow::Error::new(e).context("encode cart"),
            )),
        };

        match committed {
            Ok(()) => Ok(updated),
            Err(source) => Err(CartError::Commit {
                cart_id: cart_id.to_string(),
                source,
                release: self.release_after_failure(&lock, cart_id).await,
            }),
        }
    }

    /// Loop on SET NX until the lock is ours, parking on the wait queue
    /// between attempts.  Every wake-up is treated as "maybe free", never as
    /// a handoff.
    async fn acquire(
        &self,
        ctx: &RequestContext,
        lock: &CartLock<'_>,
        cart_id: &str,
    ) -> Result<(), CartError> {
        let timed_out = || CartError::LockTimeout {
            cart_id: cart_id.to_string(),
        };
        let failed = |source| CartError::LockAcquisition {
            cart_id: cart_id.to_string(),
            source,
            release: None,
        };

        loop {
            let ttl = ctx.remaining().filter(|r| !r.is_zero()).ok_or_else(timed_out)?;
            match ctx.bound(lock.try_acquire(ttl)).await {
                Ok(true) => {
                    if let Some(registry) = &self.metrics {
                        registry.metrics.lock_acquisitions.inc();
                    }
                    return Ok(());
                }
                Ok(false) => {}
                Err(StoreError::DeadlineExceeded) => return Err(timed_out()),
                Err(source) => return Err(failed(source)),
            }

            if let Some(registry) = &self.metrics {
                registry.metrics.lock_waits.inc();
            }
            let wait = ctx.remaining().filter(|r| !r.is_zero()).ok_or_else(timed_out)?;
            match ctx.bound(lock.wait_for_notification(wait)).await {
                Ok(true) => debug!(%cart_id, "woken, retrying lock"),
                Ok(false) | Err(StoreError::DeadlineExceeded) => return Err(timed_out()),
                Err(_) if ctx.is_expired() => return Err(timed_out()),
                Err(source) => return Err(failed(source)),
            }
        }
    }

    /// Best-effort release after a failed cycle.  Returns the release error,
    /// if any, so it can ride along with the error being surfaced.
    async fn release_after_failure(&self, lock: &CartLock<'_>, cart_id: &str) -> Option<StoreError> {
        let released = tokio::time::timeout(
            self.config.release_timeout,
            lock.release(self.config.notify_ttl),
        )
        .await
        .unwrap_or(Err(StoreError::DeadlineExceeded));

        match released {
            Ok(true) => {
                info!(%cart_id, "released cart lock after failed update");
                None
            }
            Ok(false) => {
                info!(%cart_id, "cart lock no longer ours after failed update; left in place");
                None
            }
            Err(e) => {
                warn!(%cart_id, error = %e, "could not release cart lock; it will expire on its own");
                Some(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::task::JoinSet;

    use super::*;
    use crate::coordination::locks::{mutex_key, wait_key, NOTIFY_TOKEN};
    use crate::coordination::CartReader;
    use crate::store::{BatchResults, MemoryStore};

    /// Delegates to a [`MemoryStore`] while counting calls.  It can be told
    /// to fail batches, to report an error for one op of an applied batch,
    /// or to delay (or never finish) a blocking pop.
    #[derive(Default)]
    struct InstrumentedStore {
        inner: MemoryStore,
        calls: AtomicUsize,
        fail_batches: AtomicBool,
        failing_batch_op: Option<usize>,
        pop_delay: Option<Duration>,
        stall_pops: bool,
    }

    impl InstrumentedStore {
        fn over(inner: MemoryStore) -> Self {
            Self {
                inner,
                ..Self::default()
            }
        }

        fn touch(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CartStore for InstrumentedStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.touch();
            self.inner.get(key).await
        }

        async fn set_with_expiry(
            &self,
            key: &str,
            value: &[u8],
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.touch();
            self.inner.set_with_expiry(key, value, ttl).await
        }

        async fn set_if_absent_with_expiry(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.touch();
            self.inner.set_if_absent_with_expiry(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.touch();
            self.inner.delete(key).await
        }

        async fn blocking_pop(
            &self,
            key: &str,
            timeout: Duration,
        ) -> Result<Option<String>, StoreError> {
            self.touch();
            if self.stall_pops {
                std::future::pending::<()>().await;
            }
            let mut timeout = timeout;
            if let Some(delay) = self.pop_delay {
                tokio::time::sleep(delay).await;
                timeout = timeout.saturating_sub(delay);
            }
            self.inner.blocking_pop(key, timeout).await
        }

        async fn push(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.touch();
            self.inner.push(key, value).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
            self.touch();
            self.inner.expire(key, ttl).await
        }

        async fn execute_batch(&self, ops: Vec<BatchOp>) -> Result<BatchResults, StoreError> {
            self.touch();
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(StoreError::Backend(anyhow::anyhow!("connection reset")));
            }
            let mut results = self.inner.execute_batch(ops).await?;
            if let Some(slot) = self.failing_batch_op.and_then(|i| results.get_mut(i)) {
                *slot = Err(StoreError::Backend(anyhow::anyhow!(
                    "OOM command not allowed when used memory > 'maxmemory'"
                )));
            }
            Ok(results)
        }

        async fn execute_if_equals(
            &self,
            guard_key: &str,
            expected: &str,
            ops: Vec<BatchOp>,
        ) -> Result<bool, StoreError> {
            self.touch();
            if self.fail_batches.load(Ordering::SeqCst) {
                return Err(StoreError::Backend(anyhow::anyhow!("connection reset")));
            }
            self.inner.execute_if_equals(guard_key, expected, ops).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.touch();
            Ok(())
        }
    }

    fn updater(store: &MemoryStore) -> CartUpdater {
        CartUpdater::new(Arc::new(store.clone())).with_owner("test-node")
    }

    fn reader(store: &MemoryStore) -> CartReader {
        CartReader::new(Arc::new(store.clone()))
    }

    fn ctx(ms: u64) -> RequestContext {
        RequestContext::with_timeout(Duration::from_millis(ms))
    }

    fn food_for(cart_id: &str, diner: &str, qty: u32) -> Cart {
        let mut cart = Cart::new(cart_id);
        cart.set_quantity("food", diner, qty);
        cart
    }

    /// Hold the cart mutex as some other process would.
    async fn hold_lock(store: &MemoryStore, cart_id: &str, ttl: Duration) {
        assert!(store
            .set_if_absent_with_expiry(&mutex_key(cart_id), "elsewhere:0", ttl)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rejects_context_without_deadline_before_touching_the_store() {
        let store = Arc::new(InstrumentedStore::default());
        let updater = CartUpdater::new(store.clone());

        let err = updater
            .update(&RequestContext::background(), "c1", |cart| cart)
            .await
            .unwrap_err();

        assert!(matches!(err, CartError::Configuration));
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_empty_cart_id() {
        let store = MemoryStore::new();
        let err = updater(&store)
            .update(&ctx(100), "", |cart| cart)
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::InvalidCartId));
    }

    #[tokio::test]
    async fn first_update_starts_from_empty_cart_and_saves() {
        let store = MemoryStore::new();
        let seen = updater(&store)
            .update(&ctx(100), "c1", |cart| {
                assert_eq!(cart, Cart::new("c1"));
                food_for("c1", "diner", 1)
            })
            .await
            .unwrap();
        assert_eq!(seen, food_for("c1", "diner", 1));

        let stored = reader(&store).read(&ctx(100), "c1").await.unwrap();
        assert_eq!(stored.cart_id, "c1");
        assert_eq!(stored.quantity("food", "diner"), 1);
    }

    #[tokio::test]
    async fn merge_preserves_unspecified_diners() {
        let store = MemoryStore::new();
        let updater = updater(&store);
        updater
            .update(&ctx(100), "c1", |_| {
                let mut cart = food_for("c1", "diner1", 1);
                cart.set_quantity("food", "diner2", 2);
                cart
            })
            .await
            .unwrap();

        let updates = food_for("c1", "diner2", 1);
        let merged = updater
            .update(&ctx(100), "c1", |mut cart| {
                cart.merge(&updates);
                cart
            })
            .await
            .unwrap();

        let mut expected = food_for("c1", "diner1", 1);
        expected.set_quantity("food", "diner2", 1);
        assert_eq!(merged, expected);
        assert_eq!(reader(&store).read(&ctx(100), "c1").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn transform_cannot_rename_the_cart() {
        let store = MemoryStore::new();
        let saved = updater(&store)
            .update(&ctx(100), "c1", |_| food_for("other", "diner", 1))
            .await
            .unwrap();
        assert_eq!(saved.cart_id, "c1");
        assert!(!store.contains_key(&cart_key("other")));
    }

    #[tokio::test]
    async fn commit_releases_lock_and_leaves_one_wake_up_token() {
        let store = MemoryStore::new();
        updater(&store)
            .update(&ctx(100), "c1", |cart| cart)
            .await
            .unwrap();

        assert!(!store.contains_key(&mutex_key("c1")));
        assert_eq!(store.list_len(&wait_key("c1")), 1);
        assert!(store.ttl(&wait_key("c1")).unwrap() <= Duration::from_secs(1));
        let retention = store.ttl(&cart_key("c1")).unwrap();
        assert!(retention > Duration::from_secs(4 * 60));
        assert!(retention <= Duration::from_secs(5 * 60));
    }

    #[tokio::test]
    async fn lock_ttl_is_bounded_by_the_deadline() {
        let store = MemoryStore::new();
        let observer = store.clone();
        updater(&store)
            .update(&ctx(200), "c1", move |cart| {
                let ttl = observer.ttl(&mutex_key("c1")).expect("lock held during transform");
                assert!(ttl <= Duration::from_millis(200));
                cart
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn times_out_while_lock_is_held_and_leaves_cart_untouched() {
        let store = MemoryStore::new();
        let updater = updater(&store);
        updater
            .update(&ctx(100), "c1", |_| food_for("c1", "diner", 1))
            .await
            .unwrap();
        hold_lock(&store, "c1", Duration::from_secs(2)).await;

        let started = Instant::now();
        let err = updater
            .update(&ctx(50), "c1", |_| food_for("c1", "diner", 99))
            .await
            .unwrap_err();

        assert!(matches!(err, CartError::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_millis(500));
        let stored = reader(&store).read(&ctx(100), "c1").await.unwrap();
        assert_eq!(stored.quantity("food", "diner"), 1);
    }

    #[tokio::test]
    async fn waits_for_release_then_saves() {
        let store = MemoryStore::new();
        hold_lock(&store, "c1", Duration::from_secs(2)).await;

        let releaser = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.delete(&mutex_key("c1")).await.unwrap();
            releaser.push(&wait_key("c1"), NOTIFY_TOKEN).await.unwrap();
        });

        let ctx = ctx(500);
        let saved = updater(&store)
            .update(&ctx, "c1", |_| {
                assert!(ctx.remaining().unwrap() < Duration::from_millis(480));
                food_for("c1", "diner", 1)
            })
            .await
            .unwrap();

        assert_eq!(saved.quantity("food", "diner"), 1);
    }

    #[tokio::test]
    async fn spurious_wake_up_goes_back_to_waiting() {
        let store = MemoryStore::new();
        hold_lock(&store, "c1", Duration::from_secs(2)).await;

        let other = store.clone();
        tokio::spawn(async move {
            // A token with the lock still held: the waiter must not proceed.
            tokio::time::sleep(Duration::from_millis(10)).await;
            other.push(&wait_key("c1"), NOTIFY_TOKEN).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(other.contains_key(&mutex_key("c1")));
            other.delete(&mutex_key("c1")).await.unwrap();
            other.push(&wait_key("c1"), NOTIFY_TOKEN).await.unwrap();
        });

        let started = Instant::now();
        updater(&store)
            .update(&ctx(1000), "c1", |cart| cart)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn recovers_after_holder_crash_once_ttl_expires() {
        let store = MemoryStore::new();
        // A holder that took the lock and never released it.
        hold_lock(&store, "c1", Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let saved = updater(&store)
            .update(&ctx(100), "c1", |_| food_for("c1", "diner", 3))
            .await
            .unwrap();
        assert_eq!(saved.quantity("food", "diner"), 3);
    }

    #[tokio::test]
    async fn retry_with_fresh_deadline_succeeds_after_timeout() {
        let store = MemoryStore::new();
        let updater = updater(&store);
        hold_lock(&store, "c1", Duration::from_millis(60)).await;

        let err = updater
            .update(&ctx(20), "c1", |cart| cart)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        tokio::time::sleep(Duration::from_millis(60)).await;
        updater.update(&ctx(100), "c1", |cart| cart).await.unwrap();
    }

    #[tokio::test]
    async fn read_failure_releases_lock() {
        let store = MemoryStore::new();
        // A list where the cart should be: GET fails with WRONGTYPE.
        store.push(&cart_key("c1"), "irrelevant").await.unwrap();

        let err = updater(&store)
            .update(&ctx(100), "c1", |cart| cart)
            .await
            .unwrap_err();

        assert!(matches!(err, CartError::Read { release: None, .. }));
        assert!(err.to_string().starts_with("error getting cart c1"));
        assert!(!store.contains_key(&mutex_key("c1")));
    }

    #[tokio::test]
    async fn malformed_cart_releases_lock() {
        let store = MemoryStore::new();
        store
            .set_with_expiry(&cart_key("c1"), b"totally not JSON", Duration::from_secs(1))
            .await
            .unwrap();

        let err = updater(&store)
            .update(&ctx(100), "c1", |cart| cart)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CartError::Deserialization { release: None, .. }
        ));
        assert!(!store.contains_key(&mutex_key("c1")));
        assert_eq!(
            store.get(&cart_key("c1")).await.unwrap(),
            Some(b"totally not JSON".to_vec())
        );
    }

    #[tokio::test]
    async fn transform_that_outlives_the_deadline_fails_the_commit() {
        let store = MemoryStore::new();
        let err = updater(&store)
            .update(&ctx(20), "c1", |cart| {
                std::thread::sleep(Duration::from_millis(40));
                cart
            })
            .await
            .unwrap_err();

        match &err {
            CartError::Commit {
                source, release, ..
            } => {
                assert!(source.is_deadline_exceeded());
                assert!(release.is_none());
            }
            other => panic!("expected commit error, got {other:?}"),
        }
        assert!(err.to_string().starts_with("error saving cart c1"));
        assert!(!store.contains_key(&cart_key("c1")));
        assert!(!store.contains_key(&mutex_key("c1")));
    }

    #[tokio::test]
    async fn failed_release_is_reported_with_the_commit_error() {
        let memory = MemoryStore::new();
        let store = Arc::new(InstrumentedStore::over(memory.clone()));
        store.fail_batches.store(true, Ordering::SeqCst);

        let err = CartUpdater::new(store.clone())
            .update(&ctx(200), "c1", |cart| cart)
            .await
            .unwrap_err();

        assert!(matches!(err, CartError::Commit { .. }));
        assert!(err.release_error().is_some());
        assert!(err.to_string().contains("lock release also failed"));
        // Unreleased, but bounded by the deadline it was taken with.
        assert!(memory.ttl(&mutex_key("c1")).unwrap() <= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn error_from_one_batch_op_fails_the_commit() {
        let memory = MemoryStore::new();
        let store = Arc::new(InstrumentedStore {
            inner: memory.clone(),
            // SET cart, DEL wait, LPUSH wait, PEXPIRE wait, DEL mutex.
            failing_batch_op: Some(2),
            ..InstrumentedStore::default()
        });

        let err = CartUpdater::new(store)
            .update(&ctx(200), "c1", |_| food_for("c1", "diner", 1))
            .await
            .unwrap_err();

        match &err {
            CartError::Commit {
                source, release, ..
            } => {
                assert!(source.to_string().contains("OOM"));
                assert!(release.is_none());
            }
            other => panic!("expected commit error, got {other:?}"),
        }
        assert!(!memory.contains_key(&mutex_key("c1")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cleanup_after_expired_deadline_keeps_the_next_owners_lock() {
        let store = MemoryStore::new();
        let next_owner = {
            let store = store.clone();
            tokio::spawn(async move {
                // The first updater's lock lapses with its 30ms deadline.
                tokio::time::sleep(Duration::from_millis(45)).await;
                let lock = CartLock::new(&store, "c1", "test-node");
                assert!(lock.try_acquire(Duration::from_secs(5)).await.unwrap());
                lock.token().to_string()
            })
        };

        let ctx = ctx(30);
        let err = updater(&store)
            .update(&ctx, "c1", |cart| {
                std::thread::sleep(Duration::from_millis(80));
                cart
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CartError::Commit { release: None, .. }));

        let token = next_owner.await.unwrap();
        assert_eq!(
            store.get(&mutex_key("c1")).await.unwrap(),
            Some(token.into_bytes())
        );
        let third = CartLock::new(&store, "c1", "elsewhere");
        assert!(!third.try_acquire(Duration::from_secs(1)).await.unwrap());
        assert!(!store.contains_key(&cart_key("c1")));
    }

    #[tokio::test]
    async fn lock_wait_ends_at_the_deadline_even_if_the_store_stalls() {
        let memory = MemoryStore::new();
        hold_lock(&memory, "c1", Duration::from_secs(5)).await;
        let store = Arc::new(InstrumentedStore {
            inner: memory,
            stall_pops: true,
            ..InstrumentedStore::default()
        });

        let ctx = ctx(50);
        let started = Instant::now();
        let err = CartUpdater::new(store)
            .update(&ctx, "c1", |cart| cart)
            .await
            .unwrap_err();

        assert!(matches!(err, CartError::LockTimeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn different_carts_do_not_block_each_other() {
        let store = MemoryStore::new();
        hold_lock(&store, "busy", Duration::from_secs(5)).await;

        let started = Instant::now();
        updater(&store)
            .update(&ctx(100), "free", |_| food_for("free", "diner", 1))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_serialized() {
        const WRITERS: u32 = 16;
        let store = MemoryStore::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let mut tasks = JoinSet::new();
        for n in 0..WRITERS {
            // Separate updaters stand in for separate processes.
            let updater = updater(&store).with_owner(format!("writer-{n}"));
            let in_flight = Arc::clone(&in_flight);
            let overlap = Arc::clone(&overlap);
            tasks.spawn(async move {
                let ctx = ctx(10_000);
                let outcome = updater
                    .update(&ctx, "shared", move |mut cart| {
                        if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlap.store(true, Ordering::SeqCst);
                        }
                        std::thread::sleep(Duration::from_millis(2));
                        let qty = cart.quantity("food", "diner");
                        cart.set_quantity("food", "diner", qty + 1);
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        cart
                    })
                    .await;
                outcome
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        assert!(!overlap.load(Ordering::SeqCst));
        let cart = reader(&store).read(&ctx(100), "shared").await.unwrap();
        assert_eq!(cart.quantity("food", "diner"), WRITERS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_diners_are_all_kept() {
        let store = MemoryStore::new();
        let mut tasks = JoinSet::new();
        for n in 0..8u32 {
            let updater = updater(&store);
            tasks.spawn(async move {
                let updates = food_for("shared", &format!("diner{n}"), n + 1);
                let ctx = ctx(10_000);
                let outcome = updater
                    .update(&ctx, "shared", move |mut cart| {
                        cart.merge(&updates);
                        cart
                    })
                    .await;
                outcome
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let cart = reader(&store).read(&ctx(100), "shared").await.unwrap();
        for n in 0..8u32 {
            assert_eq!(cart.quantity("food", &format!("diner{n}")), n + 1);
        }
    }

    /// The wake-up token lives only `notify_ttl`.  A waiter whose BLPOP
    /// lands after that is not woken even though the lock is free, and sits
    /// out its whole deadline.
    #[tokio::test]
    async fn late_waiter_misses_expired_wake_up_and_stalls_to_deadline() {
        let memory = MemoryStore::new();
        let holder = CartLock::new(&memory, "c1", "elsewhere");
        assert!(holder.try_acquire(Duration::from_secs(5)).await.unwrap());
        let store = Arc::new(InstrumentedStore {
            inner: memory.clone(),
            pop_delay: Some(Duration::from_millis(60)),
            ..InstrumentedStore::default()
        });
        let config = UpdaterConfig {
            notify_ttl: Duration::from_millis(5),
            ..UpdaterConfig::default()
        };

        let release = async {
            // Lands after the waiter's SET NX but before its BLPOP.
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(holder.release(config.notify_ttl).await.unwrap());
        };
        let updater = CartUpdater::new(store).with_config(config);
        let ctx = ctx(250);
        let started = Instant::now();
        let waiter = updater.update(&ctx, "c1", |cart| cart);

        let (result, ()) = tokio::join!(waiter, release);

        assert!(matches!(result, Err(CartError::LockTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(240));
        assert!(!memory.contains_key(&mutex_key("c1")));
    }
}
