//! Persistence seam for the checkout core.
//!
//! Everything that touches `Product.stock` goes through a [`Transaction`]. Stock
//! decrements are conditional (`take_stock` refuses to go below zero), so callers
//! never read stock in one transaction and write it in another.

#[cfg(test)]
mod memory;
mod mongo;

#[cfg(test)]
pub use memory::MemoryStore;
pub use mongo::MongoStore;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, StoreError};
use crate::models::{CartItem, Order, OrderStatus, PaymentStatus, Product, StockReservation};

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    async fn find_products(&self, ids: &[String]) -> Result<Vec<Product>, StoreError>;

    async fn cart_for_user(&self, user_id: &str) -> Result<Vec<CartItem>, StoreError>;

    async fn reservations_for_user(&self, user_id: &str)
        -> Result<Vec<StockReservation>, StoreError>;

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>, StoreError>;

    async fn order_number_exists(&self, order_number: &str) -> Result<bool, StoreError>;

    async fn find_order(&self, order_number: &str) -> Result<Option<Order>, StoreError>;

    async fn find_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>, StoreError>;

    /// Newest first.
    async fn orders_for_user(&self, user_id: &str) -> Result<Vec<Order>, StoreError>;
}

/// A unit of work. Dropping it without `commit` discards every write.
#[async_trait]
pub trait Transaction: Send {
    async fn product(&mut self, product_id: &str) -> Result<Option<Product>, StoreError>;

    /// Decrements stock by `quantity` only if at least that much is available.
    /// Returns `false` (and writes nothing) when the product is missing or short.
    async fn take_stock(&mut self, product_id: &str, quantity: i64) -> Result<bool, StoreError>;

    /// Returns `false` when the product no longer exists.
    async fn restock(&mut self, product_id: &str, quantity: i64) -> Result<bool, StoreError>;

    async fn reservation(
        &mut self,
        product_id: &str,
        user_id: &str,
    ) -> Result<Option<StockReservation>, StoreError>;

    async fn put_reservation(&mut self, reservation: &StockReservation) -> Result<(), StoreError>;

    async fn delete_reservation(&mut self, product_id: &str, user_id: &str)
        -> Result<bool, StoreError>;

    async fn put_cart_item(&mut self, item: &CartItem) -> Result<(), StoreError>;

    async fn delete_cart_item(&mut self, user_id: &str, product_id: &str)
        -> Result<bool, StoreError>;

    /// Fails with [`StoreError::Duplicate`] when the order number or a non-null
    /// payment intent id is already taken.
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn order(&mut self, order_number: &str) -> Result<Option<Order>, StoreError>;

    async fn set_order_status(
        &mut self,
        order_number: &str,
        status: OrderStatus,
        payment_status: PaymentStatus,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}

/// Unique keys on the orders collection, as reported in [`StoreError::Duplicate`].
pub const ORDER_NUMBER_KEY: &str = "order_number";
pub const PAYMENT_INTENT_KEY: &str = "payment_intent_id";

const TRANSACTION_ATTEMPTS: u32 = 5;

/// Runs a whole transactional unit again when it lost a write race, so
/// contending requests on the same product take turns instead of failing.
pub async fn retry_transient<T, F, Fut>(operation: &str, mut unit: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 1;
    loop {
        match unit().await {
            Err(e) if e.is_transient() && attempt < TRANSACTION_ATTEMPTS => {
                log::warn!("{} conflicted on attempt {}, retrying: {}", operation, attempt, e);
                actix_web::rt::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
