use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::error::CartError;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Rejected,
    LockFailed,
    LockTimeout,
    ReadFailed,
    DecodeFailed,
    CommitFailed,
}

impl Outcome {
    pub fn of<T>(result: &Result<T, CartError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(CartError::Configuration | CartError::InvalidCartId) => Self::Rejected,
            Err(CartError::LockAcquisition { .. }) => Self::LockFailed,
            Err(CartError::LockTimeout { .. }) => Self::LockTimeout,
            Err(CartError::Read { .. }) => Self::ReadFailed,
            Err(CartError::Deserialization { .. }) => Self::DecodeFailed,
            Err(CartError::Commit { .. }) => Self::CommitFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the cart coordinator.
pub struct Metrics {
    // -- updates --
    pub updates_total: Family<OutcomeLabels, Counter>,
    pub update_duration_seconds: Histogram,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,

    // -- reads --
    pub reads_total: Family<OutcomeLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let updates_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "groupcart_updates",
            "Coordinated cart updates by outcome",
            updates_total.clone(),
        );

        let update_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        registry.register(
            "groupcart_update_duration_seconds",
            "Cart update latency in seconds, lock wait included",
            update_duration_seconds.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "groupcart_lock_acquisitions",
            "Cart lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "groupcart_lock_waits",
            "Times a caller parked on a cart wait queue",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "groupcart_lock_timeouts",
            "Updates that gave up waiting for a cart lock",
            lock_timeouts.clone(),
        );

        let reads_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "groupcart_reads",
            "Cart reads by outcome",
            reads_total.clone(),
        );

        Self {
            updates_total,
            update_duration_seconds,
            lock_acquisitions,
            lock_waits,
            lock_timeouts,
            reads_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all cart metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Prometheus text exposition of the current values.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &self.registry)?;
        Ok(out)
    }
}
