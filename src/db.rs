use mongodb::bson::doc;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Database, IndexModel};

use crate::error::StoreError;
use crate::models::{CartItem, Order, StockReservation};

pub const PRODUCTS: &str = "products";
pub const CART_ITEMS: &str = "cart_items";
pub const RESERVATIONS: &str = "stock_reservations";
pub const ORDERS: &str = "orders";

/// Connects to MongoDB. Multi-document transactions need a replica set or sharded cluster.
pub async fn connect(
    database_url: &str,
    database_name: &str,
) -> Result<(Client, Database), StoreError> {
    let mut client_options = ClientOptions::parse(database_url).await?;
    client_options.app_name = Some("e-com-checkout".to_string());

    let client = Client::with_options(client_options)?;
    let db = client.database(database_name);
    Ok((client, db))
}

/// Creates the unique keys the checkout flow relies on. Safe to run on every start.
pub async fn ensure_indexes(db: &Database) -> Result<(), StoreError> {
    let unique = || IndexOptions::builder().unique(true).build();

    db.collection::<CartItem>(CART_ITEMS)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "user_id": 1, "product_id": 1 })
                .options(unique())
                .build(),
            None,
        )
        .await?;

    let reservations = db.collection::<StockReservation>(RESERVATIONS);
    reservations
        .create_index(
            IndexModel::builder()
                .keys(doc! { "product_id": 1, "user_id": 1 })
                .options(unique())
                .build(),
            None,
        )
        .await?;
    reservations
        .create_index(IndexModel::builder().keys(doc! { "expires_at": 1 }).build(), None)
        .await?;

    let orders = db.collection::<Order>(ORDERS);
    orders
        .create_index(
            IndexModel::builder()
                .keys(doc! { "order_number": 1 })
                .options(unique())
                .build(),
            None,
        )
        .await?;
    orders
        .create_index(
            IndexModel::builder()
                .keys(doc! { "user_id": 1, "created_at": -1 })
                .build(),
            None,
        )
        .await?;
    // COD orders store an explicit null, so only string ids take part.
    orders
        .create_index(
            IndexModel::builder()
                .keys(doc! { "payment_intent_id": 1 })
                .options(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(doc! { "payment_intent_id": { "$type": "string" } })
                        .build(),
                )
                .build(),
            None,
        )
        .await?;

    log::info!("MongoDB indexes ensured on {}", db.name());
    Ok(())
}
