use std::sync::Arc;

use tracing::trace;

use super::cart_key;
use crate::cart::{codec, Cart};
use crate::context::RequestContext;
use crate::error::CartError;
use crate::metrics::{MetricsRegistry, Outcome, OutcomeLabels};
use crate::store::CartStore;

/// Lock-free lookup of a cart's current state.
#[derive(Clone)]
pub struct CartReader {
    store: Arc<dyn CartStore>,
    metrics: Option<MetricsRegistry>,
}

impl CartReader {
    pub fn new(store: Arc<dyn CartStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fetch the cart stored under `cart_id`.
    ///
    /// A cart that was never written (or has expired) is not an error: it
    /// reads as the empty cart with that id.  The deadline in `ctx`, if any,
    /// bounds the lookup.
    pub async fn read(&self, ctx: &RequestContext, cart_id: &str) -> Result<Cart, CartError> {
        let result = self.lookup(ctx, cart_id).await;
        if let Some(registry) = &self.metrics {
            registry
                .metrics
                .reads_total
                .get_or_create(&OutcomeLabels {
                    outcome: Outcome::of(&result),
                })
                .inc();
        }
        result
    }

    async fn lookup(&self, ctx: &RequestContext, cart_id: &str) -> Result<Cart, CartError> {
        if cart_id.is_empty() {
            return Err(CartError::InvalidCartId);
        }

        let stored = ctx
            .bound(self.store.get(&cart_key(cart_id)))
            .await
            .map_err(|source| CartError::Read {
                cart_id: cart_id.to_string(),
                source,
                release: None,
            })?;

        let Some(bytes) = stored else {
            trace!(%cart_id, "cart not found, returning empty cart");
            return Ok(Cart::new(cart_id));
        };

        codec::decode(cart_id, &bytes).map_err(|source| CartError::Deserialization {
            cart_id: cart_id.to_string(),
            source,
            release: None,
        })
    }
}
