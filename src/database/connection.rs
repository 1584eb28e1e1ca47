use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};
use std::env;
use tracing::{info, warn};

pub async fn get_db_client() -> Database {
    let database_url = env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set as an environment variable");

    let client = Client::with_uri_str(&database_url)
        .await
        .expect("Failed to connect to MongoDB");

    let db_name = "koinonia";
    let db = client.database(db_name);

    match db.list_collection_names().await {
        Ok(collections) => {
            info!("Connected to database: {}", db_name);
            info!("Collections found: {:?}", collections);
        }
        Err(e) => {
            warn!("Database '{}' may not exist or is inaccessible: {}", db_name, e);
        }
    }

    db
}

/// Create the unique indexes the payment invariants rely on. Safe to run
/// on every boot; Mongo treats re-creation of an identical index as a
/// no-op.
pub async fn ensure_indexes(db: &Database) {
    // One ledger row per gateway payment intent. Sparse: rows without a
    // payment intent (failed invoices with none) are not constrained.
    let ledger_index = IndexModel::builder()
        .keys(doc! { "gateway_payment_intent_id": 1 })
        .options(
            IndexOptions::builder()
                .unique(true)
                .sparse(true)
                .build(),
        )
        .build();
    if let Err(e) = db
        .collection::<mongodb::bson::Document>("donation_transactions")
        .create_index(ledger_index)
        .await
    {
        warn!("Failed to create ledger payment-intent index: {}", e);
    }

    let order_index = IndexModel::builder()
        .keys(doc! { "order_number": 1 })
        .options(IndexOptions::builder().unique(true).build())
        .build();
    if let Err(e) = db
        .collection::<mongodb::bson::Document>("purchases")
        .create_index(order_index)
        .await
    {
        warn!("Failed to create order-number index: {}", e);
    }

    let promo_index = IndexModel::builder()
        .keys(doc! { "code": 1 })
        .options(IndexOptions::builder().unique(true).build())
        .build();
    if let Err(e) = db
        .collection::<mongodb::bson::Document>("promo_codes")
        .create_index(promo_index)
        .await
    {
        warn!("Failed to create promo-code index: {}", e);
    }
}
