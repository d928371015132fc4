//! JSON encoding of [`Cart`] records as stored in KeyDB.
//!
//! Layout: `{"cart_id": "...", "cart_details": {"<item>": {"<diner>": n}}}`.
//! Decoding is lenient about the envelope: a missing or null
//! `cart_details` is an empty cart and a missing `cart_id` is filled from
//! the key the record was read under.

use super::Cart;

pub fn encode(cart: &Cart) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(cart)
}

pub fn decode(cart_id: &str, bytes: &[u8]) -> Result<Cart, serde_json::Error> {
    let mut cart: Cart = serde_json::from_slice(bytes)?;
    if cart.cart_id.is_empty() {
        cart.cart_id = cart_id.to_string();
    }
    Ok(cart)
}
