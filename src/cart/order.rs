use std::collections::HashMap;

use super::{Cart, ItemId};

/// Item totals summed across every diner in a cart.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Order(pub HashMap<ItemId, u64>);

impl Order {
    pub fn from_cart(cart: &Cart) -> Self {
        let totals = cart
            .cart_details
            .iter()
            .map(|(item, diners)| {
                let total = diners.values().map(|&qty| u64::from(qty)).sum();
                (item.clone(), total)
            })
            .collect();
        Self(totals)
    }

    pub fn total(&self, item: &str) -> u64 {
        self.0.get(item).copied().unwrap_or(0)
    }
}
