//! Runs the cart saga against an in-memory store.
//!
//! ```bash
//! RUST_LOG=context_bus_runtime=debug,context_bus_cart_saga=debug cargo run -p context-bus-cart-saga
//! ```

use context_bus_cart_saga::{Product, add_cart_item, get_cart, seed_product};
use context_bus_testing::InMemorySessionFactory;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let factory = InMemorySessionFactory::new();
    let lamp = Product::new("Desk lamp", 3_499);
    seed_product(factory.store(), &lamp)?;
    let user_id = Uuid::new_v4();

    info!(%user_id, product_id = %lamp.id, "Adding product to cart");
    let response = add_cart_item(factory.clone(), user_id, lamp.id, 2).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    match add_cart_item(factory.clone(), user_id, lamp.id, 1).await {
        Ok(response) => println!("{}", serde_json::to_string_pretty(&response)?),
        Err(error) => warn!(status = error.status(), %error, "Second add refused"),
    }

    let response = get_cart(factory.clone(), user_id).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    let stats = factory.stats();
    info!(
        begun = stats.begun,
        committed = stats.committed,
        rolled_back = stats.rolled_back,
        "Sessions"
    );
    Ok(())
}
