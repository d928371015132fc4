//! Cart access coordinated through KeyDB (Redis-compatible).
//!
//! [`CartUpdater`] serializes read-modify-write cycles per cart across every
//! caller sharing the store, using the mutex/wait-queue lock in [`locks`].
//! [`CartReader`] is a plain lookup.  All state lives in the store, so any
//! number of processes can cooperate without local shared memory.

pub mod locks;
pub mod node;
pub mod reader;
pub mod updater;

pub use reader::CartReader;
pub use updater::{CartUpdater, UpdaterConfig};

/// Store key holding the serialized cart.
pub fn cart_key(cart_id: &str) -> String {
    format!("cart:{cart_id}")
}
