//! Card payments: intent creation for the client and verification before an order
//! is written as paid.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::{CheckoutConfig, GatewayConfig};
use crate::error::{AppError, GatewayError};
use crate::models::{CartLineInput, PaymentIntentResponse};
use crate::pricing;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: IntentStatus,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError>;
}

/// Stripe-compatible HTTP client (`/v1/payment_intents`).
pub struct StripeGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(StripeGateway {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
        })
    }

    async fn read_intent(response: reqwest::Response) -> Result<PaymentIntent, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<PaymentIntent>().await?)
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        let amount = amount_cents.to_string();
        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&[
                ("amount", amount.as_str()),
                ("currency", currency),
                ("automatic_payment_methods[enabled]", "true"),
            ])
            .send()
            .await?;
        Self::read_intent(response).await
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        let response = self
            .client
            .get(format!("{}/v1/payment_intents/{}", self.base_url, intent_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        Self::read_intent(response).await
    }
}

fn is_valid_intent_id(intent_id: &str) -> bool {
    !intent_id.is_empty()
        && intent_id.len() <= 255
        && intent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Prices the cart from the database and opens an intent for the exact total.
/// Reads only; no stock is reserved here.
pub async fn create_payment_intent(
    store: &dyn Store,
    gateway: &dyn PaymentGateway,
    config: &CheckoutConfig,
    user_id: Option<&str>,
    items: &[CartLineInput],
) -> Result<PaymentIntentResponse, AppError> {
    let lines = pricing::normalize_lines(items, config)?;
    let held = pricing::held_quantities(store, user_id, config).await?;
    let quote = pricing::quote(store, config, &lines, &held).await?;

    let intent = gateway
        .create_intent(quote.total_cents, &config.currency)
        .await?;
    let client_secret = intent
        .client_secret
        .ok_or(GatewayError::MissingField("client_secret"))?;

    log::info!(
        "Payment intent {} created for {} {}",
        intent.id,
        quote.total_cents,
        config.currency
    );
    Ok(PaymentIntentResponse {
        payment_intent_id: intent.id,
        client_secret,
        amount: quote.total_cents,
        currency: config.currency.clone(),
    })
}

/// Proves the intent paid exactly `expected_total_cents` in the shop currency and
/// has not already paid for another order.
pub async fn verify_payment(
    store: &dyn Store,
    gateway: &dyn PaymentGateway,
    config: &CheckoutConfig,
    intent_id: &str,
    expected_total_cents: i64,
) -> Result<(), AppError> {
    if !is_valid_intent_id(intent_id) {
        return Err(AppError::InvalidInput("Invalid payment intent id".into()));
    }
    if let Some(order) = store.find_order_by_payment_intent(intent_id).await? {
        log::warn!(
            "Payment intent {} replayed; already paid order {}",
            intent_id,
            order.order_number
        );
        return Err(AppError::PaymentVerificationFailed(
            "payment intent already used".into(),
        ));
    }

    let intent = match gateway.retrieve_intent(intent_id).await {
        Ok(intent) => intent,
        Err(GatewayError::Rejected { status: 404, .. }) => {
            return Err(AppError::PaymentVerificationFailed(
                "payment intent not found".into(),
            ))
        }
        Err(e) => return Err(e.into()),
    };

    if intent.status != IntentStatus::Succeeded {
        return Err(AppError::PaymentVerificationFailed(format!(
            "payment status is {:?}",
            intent.status
        )));
    }
    if intent.amount != expected_total_cents {
        log::warn!(
            "Payment intent {} amount {} does not match expected {}",
            intent_id,
            intent.amount,
            expected_total_cents
        );
        return Err(AppError::PaymentVerificationFailed(
            "payment amount does not match order total".into(),
        ));
    }
    if !intent.currency.eq_ignore_ascii_case(&config.currency) {
        return Err(AppError::PaymentVerificationFailed(
            "payment currency does not match".into(),
        ));
    }
    Ok(())
}
