//! Group-order carts kept in KeyDB, updated through a per-cart distributed
//! lock so concurrent read-modify-write cycles from any number of processes
//! never lose an update.
//!
//! Build a [`store::KeyDbStore`] once at startup, then hand it to a
//! [`CartReader`] and a [`CartUpdater`]:
//!
//! ```no_run
//! # async fn demo(pool: fred::clients::Pool) -> Result<(), groupcart::CartError> {
//! use std::sync::Arc;
//! use std::time::Duration;
//! use groupcart::{CartUpdater, RequestContext, store::KeyDbStore};
//!
//! let updater = CartUpdater::new(Arc::new(KeyDbStore::new(pool)));
//! let ctx = RequestContext::with_timeout(Duration::from_secs(2));
//! let cart = updater
//!     .update(&ctx, "cart-42", |mut cart| {
//!         cart.set_quantity("pizza", "alice", 2);
//!         cart
//!     })
//!     .await?;
//! # let _ = cart;
//! # Ok(())
//! # }
//! ```

pub mod cart;
pub mod config;
pub mod context;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod store;

pub use cart::{Cart, CartId, DinerId, ItemId, Order};
pub use context::RequestContext;
pub use coordination::{CartReader, CartUpdater, UpdaterConfig};
pub use error::{CartError, StoreError};
