//! # Cart Saga
//!
//! A shopping-cart flow built on the Context Bus, backed by the in-memory
//! transactional store.
//!
//! Adding an item fans out into two lookups that run concurrently, each in its
//! own session:
//!
//! ```text
//! AddCartItemRequested ─┬─> GetUserCart ──> UserCartRetrieved ──┐
//!                       └─> GetProductById ─> ProductByIdRetrieved ┴─> UserCartAddCartItem
//! ```
//!
//! The join publishes `UserCartAddCartItem` once both the cart and the product
//! are known. The caller drains the bus and folds the results into a JSON
//! response with [`Composable`](context_bus_core::Composable).

pub mod events;
pub mod model;
pub mod saga;
pub mod use_cases;

pub use model::{Cart, CartItem, Product};
pub use saga::{CartApiError, add_cart_item, add_cart_item_bus, get_cart, get_cart_bus};
pub use use_cases::{CartBus, CartError, GetUserCartResult, UserCartAddCartItemResult};

use context_bus_testing::InMemoryStore;
use uuid::Uuid;

/// Store `product` in the committed state of `store`.
///
/// # Errors
///
/// Returns an error if the product does not serialize.
pub fn seed_product(store: &InMemoryStore, product: &Product) -> Result<(), serde_json::Error> {
    store.insert(Product::key(product.id), serde_json::to_value(product)?);
    Ok(())
}

/// Read the committed cart owned by `user_id`, lines included.
///
/// # Errors
///
/// Returns an error if the stored header or lines are malformed.
pub fn stored_cart(
    store: &InMemoryStore,
    user_id: Uuid,
) -> Result<Option<Cart>, serde_json::Error> {
    let Some(header) = store.get(&Cart::key(user_id)) else {
        return Ok(None);
    };
    let mut cart: Cart = serde_json::from_value(header)?;
    if let Some(items) = store.get(&Cart::items_key(cart.id)) {
        cart.items = serde_json::from_value(items)?;
    }
    Ok(Some(cart))
}
