//! Bus wiring and the caller-facing flows.
//!
//! Each request builds its own bus: the join state that waits for both the cart
//! and the product lives exactly as long as the request.

use crate::events::{
    AddCartItemRequested, GetProductById, GetUserCart, ProductByIdRetrieved, UserCartAddCartItem,
    UserCartRetrieved,
};
use crate::model::{Cart, Product};
use crate::use_cases::{
    CartBus, CartError, GetUserCartResult, UserCartAddCartItemResult, get_product_by_id,
    get_user_cart, user_cart_add_cart_item,
};
use context_bus_core::{Composable, set_key};
use context_bus_runtime::{BusError, ContextBus, ContextExecutor};
use context_bus_testing::InMemorySessionFactory;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Error returned to callers, with an HTTP-style status.
#[derive(Error, Debug)]
pub enum CartApiError {
    /// The product is already in the cart
    #[error("Product already in cart")]
    PreconditionFailed,

    /// The product does not exist
    #[error("Product {0} not found")]
    NotFound(Uuid),

    /// Anything else went wrong while draining the bus
    #[error(transparent)]
    Internal(BusError),
}

impl CartApiError {
    /// Status code a transport would answer with
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::PreconditionFailed => 412,
            Self::NotFound(_) => 404,
            Self::Internal(_) => 500,
        }
    }
}

impl From<BusError> for CartApiError {
    fn from(error: BusError) -> Self {
        let mapped = match error.downcast_ref::<CartError>() {
            Some(CartError::ProductAlreadyInCart { .. }) => Some(Self::PreconditionFailed),
            Some(CartError::ProductNotFound(id)) => Some(Self::NotFound(*id)),
            _ => None,
        };
        mapped.unwrap_or_else(|| Self::Internal(error))
    }
}

/// Bus answering "get the user's cart".
#[must_use]
pub fn get_cart_bus(factory: InMemorySessionFactory) -> CartBus {
    ContextBus::builder(factory)
        .with_executor(ContextExecutor::on::<GetUserCart>().handle_in_session(get_user_cart))
        .build()
}

/// Bus answering "add a product to the user's cart".
///
/// [`AddCartItemRequested`] fans out into the cart and product lookups. A join
/// bound to both lookups' completion events publishes [`UserCartAddCartItem`]
/// once, when the second of them arrives.
#[must_use]
pub fn add_cart_item_bus(factory: InMemorySessionFactory) -> CartBus {
    let pending = Arc::new(Mutex::new(PendingAddition::default()));

    let on_request = {
        let pending = Arc::clone(&pending);
        move |bus: CartBus, request: AddCartItemRequested| {
            let pending = Arc::clone(&pending);
            async move {
                pending.lock().await.request = Some(request.clone());
                bus.publish(GetUserCart::new(request.user_id)).await;
                bus.publish(GetProductById::new(request.product_id)).await;
                Ok::<Option<()>, CartError>(None)
            }
        }
    };

    let on_cart = {
        let pending = Arc::clone(&pending);
        move |bus: CartBus, cart: Cart| {
            join(bus, Arc::clone(&pending), move |state| state.cart = Some(cart))
        }
    };

    let on_product = move |bus: CartBus, product: Product| {
        join(bus, Arc::clone(&pending), move |state| state.product = Some(product))
    };

    ContextBus::builder(factory)
        .with_executors([
            ContextExecutor::on::<AddCartItemRequested>().handle(on_request),
            ContextExecutor::on::<GetUserCart>().handle_in_session(get_user_cart),
            ContextExecutor::on::<GetProductById>().handle_in_session(get_product_by_id),
            ContextExecutor::on::<UserCartRetrieved>().handle(on_cart),
            ContextExecutor::on::<ProductByIdRetrieved>().handle(on_product),
            ContextExecutor::on::<UserCartAddCartItem>().handle_in_session(user_cart_add_cart_item),
        ])
        .build()
}

/// What the add-cart-item join has seen so far.
#[derive(Debug, Default)]
struct PendingAddition {
    request: Option<AddCartItemRequested>,
    cart: Option<Cart>,
    product: Option<Product>,
    published: bool,
}

impl PendingAddition {
    /// The follow-up event, the first time every piece is present.
    fn ready(&mut self) -> Option<UserCartAddCartItem> {
        if self.published {
            return None;
        }
        let request = self.request.as_ref()?;
        let event = UserCartAddCartItem::new(
            request.quantity,
            request.user_id,
            self.cart.clone()?,
            self.product.clone()?,
        );
        self.published = true;
        Some(event)
    }
}

async fn join(
    bus: CartBus,
    pending: Arc<Mutex<PendingAddition>>,
    update: impl FnOnce(&mut PendingAddition),
) -> Result<Option<()>, CartError> {
    let next = {
        let mut state = pending.lock().await;
        update(&mut *state);
        state.ready()
    };

    if let Some(event) = next {
        bus.publish(event).await;
    }
    Ok(None)
}

/// Fetch the user's cart, creating it on first use.
///
/// Responds with `{ "cart": { ... } }`.
///
/// # Errors
///
/// Returns [`CartApiError::Internal`] if the drain fails.
#[tracing::instrument(skip(factory))]
pub async fn get_cart(
    factory: InMemorySessionFactory,
    user_id: Uuid,
) -> Result<Map<String, Value>, CartApiError> {
    let bus = get_cart_bus(factory);
    bus.publish(GetUserCart::new(user_id)).await;
    let capture = bus.gather().await?;

    Ok(Composable::new(Map::new())
        .with_reducer(|response, result: GetUserCartResult| {
            set_key(response, "cart", result.cart.to_json());
        })
        .reduce(capture.flatten()))
}

/// Add `quantity` units of a product to the user's cart.
///
/// Responds with `{ "cart_item": { ... } }`.
///
/// # Errors
///
/// - [`CartApiError::PreconditionFailed`] if the product is already in the cart
/// - [`CartApiError::NotFound`] if the product does not exist
/// - [`CartApiError::Internal`] for any other drain failure
#[tracing::instrument(skip(factory))]
pub async fn add_cart_item(
    factory: InMemorySessionFactory,
    user_id: Uuid,
    product_id: Uuid,
    quantity: u32,
) -> Result<Map<String, Value>, CartApiError> {
    let bus = add_cart_item_bus(factory);
    bus.publish(AddCartItemRequested {
        product_id,
        quantity,
        user_id,
    })
    .await;
    let capture = bus.gather().await?;

    Ok(Composable::new(Map::new())
        .with_reducer(|response, result: UserCartAddCartItemResult| {
            set_key(response, "cart_item", result.cart_item.to_json());
        })
        .reduce(capture.flatten()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AddCartItemRequested {
        AddCartItemRequested {
            product_id: Uuid::new_v4(),
            quantity: 1,
            user_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn join_waits_for_both_lookups() {
        let mut state = PendingAddition {
            request: Some(request()),
            ..PendingAddition::default()
        };
        assert!(state.ready().is_none());

        state.cart = Some(Cart::new(Uuid::new_v4()));
        assert!(state.ready().is_none());

        state.product = Some(Product::new("Lamp", 1_999));
        assert!(state.ready().is_some());
        assert!(state.ready().is_none());
    }

    #[test]
    fn status_codes() {
        assert_eq!(CartApiError::PreconditionFailed.status(), 412);
        assert_eq!(CartApiError::NotFound(Uuid::nil()).status(), 404);
        let internal = CartApiError::from(BusError::DrainLimitExceeded { limit: 1 });
        assert_eq!(internal.status(), 500);
    }
}
