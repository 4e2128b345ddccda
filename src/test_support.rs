//! Fixtures shared by the unit tests.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::future::BoxFuture;
use jsonwebtoken::{encode, EncodingKey, Header};
use rust_decimal::Decimal;

use crate::error::GatewayError;
use crate::models::{AuthUser, Claims, Product, Role, ShippingInfo};
use crate::payment::{IntentStatus, PaymentGateway, PaymentIntent};

pub const JWT_SECRET: &str = "test-secret";

pub fn product(id: &str, price: &str, stock: i64) -> Product {
    Product {
        id: id.to_string(),
        name: format!("Product {}", id),
        price: Decimal::from_str(price).unwrap(),
        stock,
        image: Some(format!("{}.jpg", id)),
    }
}

pub fn shipping() -> ShippingInfo {
    ShippingInfo {
        name: "Ann Lee".into(),
        email: "ann@example.com".into(),
        phone: "+1 555-123-4567".into(),
        address: "12 Harbour Road".into(),
        city: "Portland".into(),
        postal_code: "97201".into(),
        country: "US".into(),
    }
}

pub fn customer(id: &str) -> AuthUser {
    AuthUser {
        id: id.to_string(),
        role: Role::Customer,
    }
}

pub fn token(sub: &str, role: Role) -> String {
    let claims = Claims {
        sub: sub.to_string(),
        role,
        exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_ref())).unwrap()
}

type RetrieveHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Scripted gateway. Intents are looked up by id; unknown ids answer 404.
#[derive(Default)]
pub struct MockGateway {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    created: Mutex<Vec<i64>>,
    hook: Mutex<Option<RetrieveHook>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_intent(&self, id: &str, amount: i64, currency: &str, status: IntentStatus) {
        self.intents.lock().unwrap().insert(
            id.to_string(),
            PaymentIntent {
                id: id.to_string(),
                amount,
                currency: currency.to_string(),
                status,
                client_secret: Some(format!("{}_secret", id)),
            },
        );
    }

    pub fn created_amounts(&self) -> Vec<i64> {
        self.created.lock().unwrap().clone()
    }

    /// Runs once, on the next `retrieve_intent`, before it answers.
    pub fn on_retrieve<F>(&self, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        let id = {
            let mut created = self.created.lock().unwrap();
            created.push(amount_cents);
            format!("pi_test_{}", created.len())
        };
        self.put_intent(&id, amount_cents, currency, IntentStatus::RequiresPaymentMethod);
        Ok(self.intents.lock().unwrap()[&id].clone())
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook().await;
        }
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or(GatewayError::Rejected {
                status: 404,
                body: "no such payment_intent".into(),
            })
    }
}
