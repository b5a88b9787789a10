//! Events exchanged by the cart saga.
//!
//! Lookups and writes are persistence events: each runs in its own session.

use crate::model::{Cart, Product};
use context_bus_core::session::SessionScope;
use context_bus_macros::{ContextEvent, PersistenceEvent};
use context_bus_testing::InMemorySession;
use uuid::Uuid;

/// Session slot carried by persistence events.
pub type Slot = Option<SessionScope<InMemorySession>>;

/// Entry point of the add-cart-item flow.
#[derive(ContextEvent, Clone, Debug)]
pub struct AddCartItemRequested {
    /// Product to add
    pub product_id: Uuid,
    /// Units to add
    pub quantity: u32,
    /// Cart owner
    pub user_id: Uuid,
}

/// Load the user's cart, creating it on first use.
#[derive(ContextEvent, PersistenceEvent, Clone, Debug)]
pub struct GetUserCart {
    /// Cart owner
    pub user_id: Uuid,
    /// Attached by the bus
    #[session]
    pub session: Slot,
}

impl GetUserCart {
    /// Unattached event for `user_id`
    #[must_use]
    pub const fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            session: None,
        }
    }
}

/// Published once the cart is known.
#[derive(ContextEvent, Clone, Debug)]
pub struct UserCartRetrieved {
    /// The loaded or created cart
    #[payload]
    pub cart: Cart,
}

/// Load a product.
#[derive(ContextEvent, PersistenceEvent, Clone, Debug)]
pub struct GetProductById {
    /// Product to load
    pub product_id: Uuid,
    /// Attached by the bus
    #[session]
    pub session: Slot,
}

impl GetProductById {
    /// Unattached event for `product_id`
    #[must_use]
    pub const fn new(product_id: Uuid) -> Self {
        Self {
            product_id,
            session: None,
        }
    }
}

/// Published once the product is known.
#[derive(ContextEvent, Clone, Debug)]
pub struct ProductByIdRetrieved {
    /// The loaded product
    #[payload]
    pub product: Product,
}

/// Add `product` to `cart`. Published when both halves of the lookup are in.
#[derive(ContextEvent, PersistenceEvent, Clone, Debug)]
pub struct UserCartAddCartItem {
    /// Units to add
    pub quantity: u32,
    /// Cart owner
    pub user_id: Uuid,
    /// Cart as seen by the lookup
    pub cart: Cart,
    /// Product to add
    pub product: Product,
    /// Attached by the bus
    #[session]
    pub session: Slot,
}

impl UserCartAddCartItem {
    /// Unattached event
    #[must_use]
    pub const fn new(quantity: u32, user_id: Uuid, cart: Cart, product: Product) -> Self {
        Self {
            quantity,
            user_id,
            cart,
            product,
            session: None,
        }
    }
}
