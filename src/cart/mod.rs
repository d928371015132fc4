//! Cart data model.
//!
//! A [`Cart`] is a group order: for every item, how many of it each diner
//! wants.  Quantities are unsigned so a negative count cannot be stored, and
//! an absent `(item, diner)` pair reads as zero.

pub mod codec;
pub mod order;

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

pub use order::Order;

pub type CartId = String;
pub type ItemId = String;
pub type DinerId = String;

/// Per-diner quantities for a single item.
pub type ItemDetails = HashMap<DinerId, u32>;

/// Item -> diner -> quantity.
pub type CartDetails = HashMap<ItemId, ItemDetails>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    #[serde(default)]
    pub cart_id: CartId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub cart_details: CartDetails,
}

/// A stored `"cart_details": null` is the empty cart, not an error.
fn null_as_empty<'de, D>(deserializer: D) -> Result<CartDetails, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<CartDetails>::deserialize(deserializer)?.unwrap_or_default())
}

impl Cart {
    /// The empty cart for `cart_id`.  This is what a never-written cart reads as.
    pub fn new(cart_id: impl Into<CartId>) -> Self {
        Self {
            cart_id: cart_id.into(),
            cart_details: CartDetails::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cart_details.is_empty()
    }

    /// Quantity `diner` has of `item`; zero when either is absent.
    pub fn quantity(&self, item: &str, diner: &str) -> u32 {
        self.cart_details
            .get(item)
            .and_then(|diners| diners.get(diner))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_quantity(&mut self, item: impl Into<ItemId>, diner: impl Into<DinerId>, qty: u32) {
        self.cart_details
            .entry(item.into())
            .or_default()
            .insert(diner.into(), qty);
    }

    /// Overlay `updates` onto this cart.
    ///
    /// Items missing here are copied over whole.  For items present on both
    /// sides only the diners named in `updates` are overwritten; everything
    /// else is left untouched.
    pub fn merge(&mut self, updates: &Cart) {
        for (item, diners) in &updates.cart_details {
            match self.cart_details.get_mut(item) {
                None => {
                    self.cart_details.insert(item.clone(), diners.clone());
                }
                Some(current) => {
                    for (diner, qty) in diners {
                        current.insert(diner.clone(), *qty);
                    }
                }
            }
        }
    }
}
