//! Cart domain records as they live in the store.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// A product available for sale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier
    pub id: Uuid,
    /// Display name
    pub name: String,
    /// Unit price in cents
    pub price_cents: i64,
}

impl Product {
    /// Create a product with a fresh identifier
    #[must_use]
    pub fn new(name: impl Into<String>, price_cents: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            price_cents,
        }
    }

    /// Store key for the product with `id`
    #[must_use]
    pub fn key(id: Uuid) -> String {
        format!("product:{id}")
    }
}

/// One line of a cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Line identifier
    pub id: Uuid,
    /// Owning cart
    pub cart_id: Uuid,
    /// Product on this line
    pub product_id: Uuid,
    /// Units ordered
    pub quantity: u32,
}

impl CartItem {
    /// JSON form used in responses
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "cart_id": self.cart_id,
            "product_id": self.product_id,
            "quantity": self.quantity,
        })
    }
}

/// A user's cart. Each user has at most one.
///
/// The header lives under [`Cart::key`] and the lines under [`Cart::items_key`],
/// so creating a cart never overwrites lines another session added.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    /// Cart identifier
    pub id: Uuid,
    /// Owner
    pub user_id: Uuid,
    /// Lines, in insertion order
    #[serde(skip)]
    pub items: Vec<CartItem>,
}

impl Cart {
    /// An empty cart for `user_id`
    #[must_use]
    pub fn new(user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            items: Vec::new(),
        }
    }

    /// Store key for the cart owned by `user_id`
    #[must_use]
    pub fn key(user_id: Uuid) -> String {
        format!("cart:{user_id}")
    }

    /// Store key for the lines of the cart with `id`
    #[must_use]
    pub fn items_key(id: Uuid) -> String {
        format!("cart_items:{id}")
    }

    /// Whether a line for `product_id` exists
    #[must_use]
    pub fn contains(&self, product_id: Uuid) -> bool {
        self.items.iter().any(|item| item.product_id == product_id)
    }

    /// Append a line for `product_id` and return it
    pub fn add_item(&mut self, product_id: Uuid, quantity: u32) -> CartItem {
        let item = CartItem {
            id: Uuid::new_v4(),
            cart_id: self.id,
            product_id,
            quantity,
        };
        self.items.push(item.clone());
        item
    }

    /// JSON form used in responses
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "user_id": self.user_id,
            "items": self.items.iter().map(CartItem::to_json).collect::<Vec<_>>(),
        })
    }
}
