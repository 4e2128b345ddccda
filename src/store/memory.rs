//! In-process store used as the test double for MongoDB.
//!
//! Transactions hold the table lock for their whole lifetime and work on a copy,
//! so they are fully serialized and a dropped transaction leaves no trace.
//! Tests can script the races a real database produces: lost commits and order
//! numbers taken between the existence check and the insert.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Store, Transaction, ORDER_NUMBER_KEY, PAYMENT_INTENT_KEY};
use crate::error::StoreError;
use crate::models::{CartItem, Order, OrderStatus, PaymentStatus, Product, StockReservation};

#[derive(Debug, Default, Clone)]
struct Tables {
    products: HashMap<String, Product>,
    // keyed (user_id, product_id)
    cart: HashMap<(String, String), CartItem>,
    // keyed (product_id, user_id)
    reservations: HashMap<(String, String), StockReservation>,
    orders: Vec<Order>,
    // taken by a writer the existence check cannot see yet
    hidden_order_numbers: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    conflicts: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_product(&self, product: Product) {
        let mut tables = self.tables.lock().await;
        tables.products.insert(product.id.clone(), product);
    }

    pub async fn remove_product(&self, product_id: &str) {
        self.tables.lock().await.products.remove(product_id);
    }

    pub async fn product(&self, product_id: &str) -> Option<Product> {
        self.tables.lock().await.products.get(product_id).cloned()
    }

    pub async fn stock(&self, product_id: &str) -> i64 {
        self.product(product_id).await.map(|p| p.stock).unwrap_or(-1)
    }

    pub async fn set_stock(&self, product_id: &str, stock: i64) {
        if let Some(p) = self.tables.lock().await.products.get_mut(product_id) {
            p.stock = stock;
        }
    }

    pub async fn set_price(&self, product_id: &str, price: rust_decimal::Decimal) {
        if let Some(p) = self.tables.lock().await.products.get_mut(product_id) {
            p.price = price;
        }
    }

    pub async fn reservation(&self, product_id: &str, user_id: &str) -> Option<StockReservation> {
        self.tables
            .lock()
            .await
            .reservations
            .get(&(product_id.to_string(), user_id.to_string()))
            .cloned()
    }

    pub async fn put_reservation(&self, reservation: StockReservation) {
        let key = (reservation.product_id.clone(), reservation.user_id.clone());
        self.tables.lock().await.reservations.insert(key, reservation);
    }

    pub async fn cart_item(&self, user_id: &str, product_id: &str) -> Option<CartItem> {
        self.tables
            .lock()
            .await
            .cart
            .get(&(user_id.to_string(), product_id.to_string()))
            .cloned()
    }

    pub async fn order_count(&self) -> usize {
        self.tables.lock().await.orders.len()
    }

    pub async fn orders_paid_by(&self, payment_intent_id: &str) -> usize {
        self.tables
            .lock()
            .await
            .orders
            .iter()
            .filter(|o| o.payment_intent_id.as_deref() == Some(payment_intent_id))
            .count()
    }

    /// The next `n` commits fail with a write conflict and discard their work.
    pub fn fail_next_commits(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Makes `order_number` collide on insert while `order_number_exists` still
    /// reports it free.
    pub async fn hide_order_number(&self, order_number: &str) {
        self.tables
            .lock()
            .await
            .hidden_order_numbers
            .insert(order_number.to_string());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            work,
            conflicts: self.conflicts.clone(),
        }))
    }

    async fn find_products(&self, ids: &[String]) -> Result<Vec<Product>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.products.get(id).cloned())
            .collect())
    }

    async fn cart_for_user(&self, user_id: &str) -> Result<Vec<CartItem>, StoreError> {
        let tables = self.tables.lock().await;
        let mut items: Vec<CartItem> = tables
            .cart
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        Ok(items)
    }

    async fn reservations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<StockReservation>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>, StoreError> {
        let tables = self.tables.lock().await;
        let mut expired: Vec<StockReservation> = tables
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }

    async fn order_number_exists(&self, order_number: &str) -> Result<bool, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.orders.iter().any(|o| o.order_number == order_number))
    }

    async fn find_order(&self, order_number: &str) -> Result<Option<Order>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .iter()
            .find(|o| o.order_number == order_number)
            .cloned())
    }

    async fn find_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .iter()
            .find(|o| o.payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned())
    }

    async fn orders_for_user(&self, user_id: &str) -> Result<Vec<Order>, StoreError> {
        let tables = self.tables.lock().await;
        let mut orders: Vec<Order> = tables
            .orders
            .iter()
            .filter(|o| o.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    conflicts: Arc<AtomicU32>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn product(&mut self, product_id: &str) -> Result<Option<Product>, StoreError> {
        Ok(self.work.products.get(product_id).cloned())
    }

    async fn take_stock(&mut self, product_id: &str, quantity: i64) -> Result<bool, StoreError> {
        match self.work.products.get_mut(product_id) {
            Some(p) if p.stock >= quantity => {
                p.stock -= quantity;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn restock(&mut self, product_id: &str, quantity: i64) -> Result<bool, StoreError> {
        match self.work.products.get_mut(product_id) {
            Some(p) => {
                p.stock += quantity;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reservation(
        &mut self,
        product_id: &str,
        user_id: &str,
    ) -> Result<Option<StockReservation>, StoreError> {
        Ok(self
            .work
            .reservations
            .get(&(product_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn put_reservation(&mut self, reservation: &StockReservation) -> Result<(), StoreError> {
        let key = (reservation.product_id.clone(), reservation.user_id.clone());
        self.work.reservations.insert(key, reservation.clone());
        Ok(())
    }

    async fn delete_reservation(
        &mut self,
        product_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .work
            .reservations
            .remove(&(product_id.to_string(), user_id.to_string()))
            .is_some())
    }

    async fn put_cart_item(&mut self, item: &CartItem) -> Result<(), StoreError> {
        let key = (item.user_id.clone(), item.product_id.clone());
        self.work.cart.insert(key, item.clone());
        Ok(())
    }

    async fn delete_cart_item(
        &mut self,
        user_id: &str,
        product_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .work
            .cart
            .remove(&(user_id.to_string(), product_id.to_string()))
            .is_some())
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let number_taken = self.work.hidden_order_numbers.contains(&order.order_number)
            || self
                .work
                .orders
                .iter()
                .any(|o| o.order_number == order.order_number);
        if number_taken {
            return Err(StoreError::Duplicate {
                key: ORDER_NUMBER_KEY,
                value: order.order_number.clone(),
            });
        }
        if let Some(intent) = order.payment_intent_id.as_deref() {
            if self
                .work
                .orders
                .iter()
                .any(|o| o.payment_intent_id.as_deref() == Some(intent))
            {
                return Err(StoreError::Duplicate {
                    key: PAYMENT_INTENT_KEY,
                    value: intent.to_string(),
                });
            }
        }
        self.work.orders.push(order.clone());
        Ok(())
    }

    async fn order(&mut self, order_number: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .work
            .orders
            .iter()
            .find(|o| o.order_number == order_number)
            .cloned())
    }

    async fn set_order_status(
        &mut self,
        order_number: &str,
        status: OrderStatus,
        payment_status: PaymentStatus,
    ) -> Result<(), StoreError> {
        if let Some(order) = self
            .work
            .orders
            .iter_mut()
            .find(|o| o.order_number == order_number)
        {
            order.status = status;
            order.payment_status = payment_status;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard,
            work,
            conflicts,
        } = *self;
        let lost = conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StoreError::Conflict("scripted commit conflict".into()));
        }
        *guard = work;
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
