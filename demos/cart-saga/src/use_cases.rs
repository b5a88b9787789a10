//! Persistence handlers for the cart saga.
//!
//! Each handler reads and writes through the session the bus attached to its
//! event. Returning an error rolls that session back.

use crate::events::{
    GetProductById, GetUserCart, ProductByIdRetrieved, UserCartAddCartItem, UserCartRetrieved,
};
use crate::model::{Cart, CartItem, Product};
use context_bus_core::session::{SessionError, attached};
use context_bus_runtime::ContextBus;
use context_bus_testing::{InMemorySession, InMemorySessionFactory};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// The bus every cart handler runs on.
pub type CartBus = ContextBus<InMemorySessionFactory>;

/// Domain failures raised by cart handlers.
#[derive(Error, Debug)]
pub enum CartError {
    /// The product already has a line in the cart
    #[error("Product {product_id} is already in the cart")]
    ProductAlreadyInCart {
        /// The duplicate product
        product_id: Uuid,
    },

    /// No product with this identifier
    #[error("Product {0} not found")]
    ProductNotFound(Uuid),

    /// The session could not be used
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A stored record did not (de)serialize
    #[error("Malformed record: {0}")]
    Record(#[from] serde_json::Error),
}

/// Result of [`get_user_cart`].
#[derive(Clone, Debug)]
pub struct GetUserCartResult {
    /// The user's cart
    pub cart: Cart,
}

/// Result of [`user_cart_add_cart_item`].
#[derive(Clone, Debug)]
pub struct UserCartAddCartItemResult {
    /// The new line
    pub cart_item: CartItem,
}

/// Load the user's cart, creating and storing an empty one if none exists, then
/// publish [`UserCartRetrieved`].
///
/// # Errors
///
/// Returns [`CartError`] if the session is unusable or the stored cart is malformed.
pub async fn get_user_cart(
    bus: CartBus,
    event: GetUserCart,
) -> Result<Option<GetUserCartResult>, CartError> {
    let cart = {
        let scope = attached(&event.session)?;
        let mut session = scope.lock().await?;
        let key = Cart::key(event.user_id);

        if let Some(mut cart) = session.get_as::<Cart>(&key)? {
            cart.items = load_items(&session, cart.id)?;
            cart
        } else {
            let cart = Cart::new(event.user_id);
            session.put_as(key, &cart)?;
            debug!(user_id = %event.user_id, cart_id = %cart.id, "Created cart");
            cart
        }
    };

    bus.publish(UserCartRetrieved { cart: cart.clone() }).await;
    Ok(Some(GetUserCartResult { cart }))
}

/// Load a product and publish [`ProductByIdRetrieved`].
///
/// # Errors
///
/// Returns [`CartError::ProductNotFound`] for an unknown identifier.
pub async fn get_product_by_id(
    bus: CartBus,
    event: GetProductById,
) -> Result<Option<Product>, CartError> {
    let product = {
        let scope = attached(&event.session)?;
        let session = scope.lock().await?;
        session
            .get_as::<Product>(&Product::key(event.product_id))?
            .ok_or(CartError::ProductNotFound(event.product_id))?
    };

    bus.publish(ProductByIdRetrieved {
        product: product.clone(),
    })
    .await;
    Ok(Some(product))
}

/// Add the product to the user's cart.
///
/// The stored cart header wins over the one carried by the event when both
/// exist. Lines are re-read from the store and only the line list is written.
///
/// # Errors
///
/// Returns [`CartError::ProductAlreadyInCart`] if the cart already has a line
/// for the product.
pub async fn user_cart_add_cart_item(
    _bus: CartBus,
    event: UserCartAddCartItem,
) -> Result<Option<UserCartAddCartItemResult>, CartError> {
    let scope = attached(&event.session)?;
    let mut session = scope.lock().await?;

    let mut cart = session
        .get_as::<Cart>(&Cart::key(event.user_id))?
        .unwrap_or_else(|| event.cart.clone());
    cart.items = load_items(&session, cart.id)?;
    if cart.contains(event.product.id) {
        return Err(CartError::ProductAlreadyInCart {
            product_id: event.product.id,
        });
    }

    let cart_item = cart.add_item(event.product.id, event.quantity);
    session.put_as(Cart::items_key(cart.id), &cart.items)?;
    debug!(cart_id = %cart.id, product_id = %event.product.id, "Added cart item");

    Ok(Some(UserCartAddCartItemResult { cart_item }))
}

fn load_items(
    session: &InMemorySession,
    cart_id: Uuid,
) -> Result<Vec<CartItem>, serde_json::Error> {
    Ok(session
        .get_as::<Vec<CartItem>>(&Cart::items_key(cart_id))?
        .unwrap_or_default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stored_cart;
    use context_bus_core::session::{SessionFactory, SessionScope};

    #[tokio::test]
    async fn cart_creation_committed_late_keeps_added_items() {
        let factory = InMemorySessionFactory::new();
        let user_id = Uuid::new_v4();
        let product = Product::new("Desk lamp", 3_499);

        // Creates the cart but stays open until the add has committed.
        let creating = SessionScope::new(factory.begin().await.unwrap());
        let mut lookup = GetUserCart::new(user_id);
        lookup.session = Some(creating.clone());
        let created = get_user_cart(ContextBus::new(factory.clone()), lookup)
            .await
            .unwrap()
            .unwrap();

        let adding = SessionScope::new(factory.begin().await.unwrap());
        let mut add = UserCartAddCartItem::new(2, user_id, created.cart.clone(), product.clone());
        add.session = Some(adding.clone());
        let added = user_cart_add_cart_item(ContextBus::new(factory.clone()), add)
            .await
            .unwrap()
            .unwrap();
        adding.commit().await.unwrap();
        creating.commit().await.unwrap();

        let cart = stored_cart(factory.store(), user_id).unwrap().unwrap();
        assert_eq!(cart.id, created.cart.id);
        assert_eq!(cart.items, vec![added.cart_item]);
    }

    #[tokio::test]
    async fn retrieved_cart_carries_stored_items() {
        let factory = InMemorySessionFactory::new();
        let user_id = Uuid::new_v4();
        let bus = ContextBus::new(factory.clone());

        let first = SessionScope::new(factory.begin().await.unwrap());
        let mut lookup = GetUserCart::new(user_id);
        lookup.session = Some(first.clone());
        let created = get_user_cart(bus.clone(), lookup).await.unwrap().unwrap();

        let mut add = UserCartAddCartItem::new(1, user_id, created.cart, Product::new("Mug", 899));
        add.session = Some(first.clone());
        user_cart_add_cart_item(bus.clone(), add).await.unwrap();
        first.commit().await.unwrap();

        let second = SessionScope::new(factory.begin().await.unwrap());
        let mut lookup = GetUserCart::new(user_id);
        lookup.session = Some(second.clone());
        let fetched = get_user_cart(bus, lookup).await.unwrap().unwrap();
        second.rollback().await.unwrap();

        assert_eq!(fetched.cart.items.len(), 1);
        assert_eq!(fetched.cart.items[0].quantity, 1);
    }
}
