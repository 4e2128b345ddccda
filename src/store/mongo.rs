use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::error::{ErrorKind, WriteFailure, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::{FindOptions, ReplaceOptions};
use mongodb::{Client, ClientSession, Collection, Database};

use super::{Store, Transaction, ORDER_NUMBER_KEY, PAYMENT_INTENT_KEY};
use crate::db::{CART_ITEMS, ORDERS, PRODUCTS, RESERVATIONS};
use crate::error::StoreError;
use crate::models::{CartItem, Order, OrderStatus, PaymentStatus, Product, StockReservation};

const COMMIT_ATTEMPTS: usize = 3;

#[derive(Clone)]
struct Collections {
    products: Collection<Product>,
    cart: Collection<CartItem>,
    reservations: Collection<StockReservation>,
    orders: Collection<Order>,
}

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    collections: Collections,
}

impl MongoStore {
    /// `db` must come from `client`; sessions are started on the client.
    pub fn new(client: Client, db: &Database) -> Self {
        let collections = Collections {
            products: db.collection(PRODUCTS),
            cart: db.collection(CART_ITEMS),
            reservations: db.collection(RESERVATIONS),
            orders: db.collection(ORDERS),
        };
        MongoStore {
            client,
            collections,
        }
    }
}

/// For an E11000 error, the unique key it hit. The server names the index in
/// the message (`index: payment_intent_id_1 dup key: ...`).
fn duplicate_key(err: &mongodb::error::Error) -> Option<&'static str> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == 11000 => {
            if e.message.contains(PAYMENT_INTENT_KEY) {
                Some(PAYMENT_INTENT_KEY)
            } else {
                Some(ORDER_NUMBER_KEY)
            }
        }
        _ => None,
    }
}

fn reservation_key(product_id: &str, user_id: &str) -> Document {
    doc! { "product_id": product_id, "user_id": user_id }
}

#[async_trait]
impl Store for MongoStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        Ok(Box::new(MongoTransaction {
            session,
            collections: self.collections.clone(),
        }))
    }

    async fn find_products(&self, ids: &[String]) -> Result<Vec<Product>, StoreError> {
        let cursor = self
            .collections
            .products
            .find(doc! { "_id": { "$in": ids.to_vec() } }, None)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn cart_for_user(&self, user_id: &str) -> Result<Vec<CartItem>, StoreError> {
        let options = FindOptions::builder().sort(doc! { "product_id": 1 }).build();
        let cursor = self
            .collections
            .cart
            .find(doc! { "user_id": user_id }, options)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn reservations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<StockReservation>, StoreError> {
        let cursor = self
            .collections
            .reservations
            .find(doc! { "user_id": user_id }, None)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>, StoreError> {
        let options = FindOptions::builder().sort(doc! { "expires_at": 1 }).build();
        let cursor = self
            .collections
            .reservations
            .find(
                doc! { "expires_at": { "$lt": bson::DateTime::from_chrono(now) } },
                options,
            )
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn order_number_exists(&self, order_number: &str) -> Result<bool, StoreError> {
        let count = self
            .collections
            .orders
            .count_documents(doc! { "order_number": order_number }, None)
            .await?;
        Ok(count > 0)
    }

    async fn find_order(&self, order_number: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .collections
            .orders
            .find_one(doc! { "order_number": order_number }, None)
            .await?)
    }

    async fn find_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        Ok(self
            .collections
            .orders
            .find_one(doc! { "payment_intent_id": payment_intent_id }, None)
            .await?)
    }

    async fn orders_for_user(&self, user_id: &str) -> Result<Vec<Order>, StoreError> {
        let options = FindOptions::builder().sort(doc! { "created_at": -1 }).build();
        let cursor = self
            .collections
            .orders
            .find(doc! { "user_id": user_id }, options)
            .await?;
        Ok(cursor.try_collect().await?)
    }
}

struct MongoTransaction {
    session: ClientSession,
    collections: Collections,
}

#[async_trait]
impl Transaction for MongoTransaction {
    async fn product(&mut self, product_id: &str) -> Result<Option<Product>, StoreError> {
        Ok(self
            .collections
            .products
            .find_one_with_session(doc! { "_id": product_id }, None, &mut self.session)
            .await?)
    }

    async fn take_stock(&mut self, product_id: &str, quantity: i64) -> Result<bool, StoreError> {
        let result = self
            .collections
            .products
            .update_one_with_session(
                doc! { "_id": product_id, "stock": { "$gte": quantity } },
                doc! { "$inc": { "stock": -quantity } },
                None,
                &mut self.session,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn restock(&mut self, product_id: &str, quantity: i64) -> Result<bool, StoreError> {
        let result = self
            .collections
            .products
            .update_one_with_session(
                doc! { "_id": product_id },
                doc! { "$inc": { "stock": quantity } },
                None,
                &mut self.session,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn reservation(
        &mut self,
        product_id: &str,
        user_id: &str,
    ) -> Result<Option<StockReservation>, StoreError> {
        Ok(self
            .collections
            .reservations
            .find_one_with_session(reservation_key(product_id, user_id), None, &mut self.session)
            .await?)
    }

    async fn put_reservation(&mut self, reservation: &StockReservation) -> Result<(), StoreError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collections
            .reservations
            .replace_one_with_session(
                reservation_key(&reservation.product_id, &reservation.user_id),
                reservation,
                options,
                &mut self.session,
            )
            .await?;
        Ok(())
    }

    async fn delete_reservation(
        &mut self,
        product_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let result = self
            .collections
            .reservations
            .delete_one_with_session(reservation_key(product_id, user_id), None, &mut self.session)
            .await?;
        Ok(result.deleted_count == 1)
    }

    async fn put_cart_item(&mut self, item: &CartItem) -> Result<(), StoreError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collections
            .cart
            .replace_one_with_session(
                doc! { "user_id": item.user_id.as_str(), "product_id": item.product_id.as_str() },
                item,
                options,
                &mut self.session,
            )
            .await?;
        Ok(())
    }

    async fn delete_cart_item(
        &mut self,
        user_id: &str,
        product_id: &str,
    ) -> Result<bool, StoreError> {
        let result = self
            .collections
            .cart
            .delete_one_with_session(
                doc! { "user_id": user_id, "product_id": product_id },
                None,
                &mut self.session,
            )
            .await?;
        Ok(result.deleted_count == 1)
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let result = self
            .collections
            .orders
            .insert_one_with_session(order, None, &mut self.session)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => match duplicate_key(&e) {
                Some(key) if key == PAYMENT_INTENT_KEY => Err(StoreError::Duplicate {
                    key,
                    value: order.payment_intent_id.clone().unwrap_or_default(),
                }),
                Some(key) => Err(StoreError::Duplicate {
                    key,
                    value: order.order_number.clone(),
                }),
                None => Err(e.into()),
            },
        }
    }

    async fn order(&mut self, order_number: &str) -> Result<Option<Order>, StoreError> {
        Ok(self
            .collections
            .orders
            .find_one_with_session(doc! { "order_number": order_number }, None, &mut self.session)
            .await?)
    }

    async fn set_order_status(
        &mut self,
        order_number: &str,
        status: OrderStatus,
        payment_status: PaymentStatus,
    ) -> Result<(), StoreError> {
        let status = bson::to_bson(&status).map_err(|e| StoreError::Malformed(e.to_string()))?;
        let payment_status =
            bson::to_bson(&payment_status).map_err(|e| StoreError::Malformed(e.to_string()))?;
        self.collections
            .orders
            .update_one_with_session(
                doc! { "order_number": order_number },
                doc! { "$set": { "status": status, "payment_status": payment_status } },
                None,
                &mut self.session,
            )
            .await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                        && attempt < COMMIT_ATTEMPTS =>
                {
                    log::warn!("Retrying commit after unknown result: {}", e);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn abort(mut self: Box<Self>) -> Result<(), StoreError> {
        self.session.abort_transaction().await?;
        Ok(())
    }
}
