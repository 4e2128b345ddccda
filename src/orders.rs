//! Order placement: the one place a cart becomes a permanent order.
//!
//! Validation, pricing and payment verification all run before the transaction
//! opens. The transaction writes the order snapshot and every stock change, or
//! nothing.

use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

use crate::config::CheckoutConfig;
use crate::error::{AppError, StoreError};
use crate::models::{
    AuthUser, Order, OrderItem, OrderStatus, OrderView, PaymentMethod, PaymentStatus,
    PlaceOrderInput, PlacedOrder, ShippingInfo,
};
use crate::payment::{self, PaymentGateway};
use crate::pricing::{self, from_cents, Quote};
use crate::store::{retry_transient, Store, Transaction, ORDER_NUMBER_KEY, PAYMENT_INTENT_KEY};

const ORDER_NUMBER_PREFIX: &str = "ORD-";
const ORDER_NUMBER_LEN: usize = 10;
const ORDER_NUMBER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn generate_order_number() -> String {
    let mut rng = rand::thread_rng();
    let code: String = (0..ORDER_NUMBER_LEN)
        .map(|_| ORDER_NUMBER_CHARSET[rng.gen_range(0..ORDER_NUMBER_CHARSET.len())] as char)
        .collect();
    format!("{}{}", ORDER_NUMBER_PREFIX, code)
}

/// Draws candidates from `generate` until one is not already taken.
pub async fn allocate_order_number<G>(
    store: &dyn Store,
    max_attempts: u32,
    mut generate: G,
) -> Result<String, AppError>
where
    G: FnMut() -> String,
{
    for attempt in 1..=max_attempts {
        let candidate = generate();
        if !store.order_number_exists(&candidate).await? {
            return Ok(candidate);
        }
        log::warn!("Order number collision on attempt {}: {}", attempt, candidate);
    }
    Err(AppError::OrderNumberExhausted(max_attempts))
}

fn require_len(value: &str, field: &str, min: usize, max: usize) -> Result<String, AppError> {
    let value = value.trim();
    let len = value.chars().count();
    if len < min || len > max {
        return Err(AppError::InvalidInput(format!(
            "{} must be between {} and {} characters",
            field, min, max
        )));
    }
    Ok(value.to_string())
}

fn is_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}

fn is_phone(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '+' | '-' | '(' | ')'))
        && value.chars().filter(char::is_ascii_digit).count() >= 7
}

/// Returns the shipping info trimmed, or the first field that fails.
pub fn validate_shipping(info: &ShippingInfo) -> Result<ShippingInfo, AppError> {
    let email = require_len(&info.email, "email", 3, 254)?;
    if !is_email(&email) {
        return Err(AppError::InvalidInput("email is not a valid address".into()));
    }
    let phone = require_len(&info.phone, "phone", 7, 20)?;
    if !is_phone(&phone) {
        return Err(AppError::InvalidInput("phone is not a valid number".into()));
    }
    Ok(ShippingInfo {
        name: require_len(&info.name, "name", 2, 100)?,
        email,
        phone,
        address: require_len(&info.address, "address", 5, 200)?,
        city: require_len(&info.city, "city", 2, 100)?,
        postal_code: require_len(&info.postal_code, "postal_code", 3, 20)?,
        country: require_len(&info.country, "country", 2, 56)?,
    })
}

async fn rollback(tx: Box<dyn Transaction>) {
    if let Err(e) = tx.abort().await {
        log::error!("Rollback failed: {}", e);
    }
}

/// Writes the order and its stock movements in one transaction.
///
/// When reservations are consumed, a signed-in buyer's hold covers part of the
/// quantity and only the remainder leaves `Product.stock`; any surplus hold goes
/// back. The hold and the cart line are deleted with the order.
async fn commit_order(
    store: &dyn Store,
    config: &CheckoutConfig,
    order: &Order,
) -> Result<(), AppError> {
    let consuming_user = order
        .user_id
        .as_deref()
        .filter(|_| config.consume_reservations);

    let mut tx = store.begin().await?;
    tx.insert_order(order).await?;

    for item in &order.items {
        let held = match consuming_user {
            Some(user_id) => tx
                .reservation(&item.product_id, user_id)
                .await?
                .map(|r| r.quantity)
                .unwrap_or(0),
            None => 0,
        };

        let need = item.quantity - held;
        if need > 0 {
            if !tx.take_stock(&item.product_id, need).await? {
                rollback(tx).await;
                return Err(AppError::OutOfStock {
                    product_id: item.product_id.clone(),
                });
            }
        } else if need < 0 {
            tx.restock(&item.product_id, -need).await?;
        }

        if let Some(user_id) = consuming_user {
            tx.delete_reservation(&item.product_id, user_id).await?;
            tx.delete_cart_item(user_id, &item.product_id).await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Numbers the order and commits it. A number that another writer took after the
/// existence check is drawn again, within the same attempt budget; a payment
/// intent that another order committed first fails verification.
async fn commit_with_fresh_number<G>(
    store: &dyn Store,
    config: &CheckoutConfig,
    order: &mut Order,
    mut generate: G,
) -> Result<(), AppError>
where
    G: FnMut() -> String,
{
    let max_attempts = config.order_number_max_attempts;
    for attempt in 1..=max_attempts {
        order.order_number = allocate_order_number(store, max_attempts, &mut generate).await?;
        let numbered: &Order = order;
        let result =
            retry_transient("Order placement", || commit_order(store, config, numbered)).await;
        match result {
            Err(AppError::Store(StoreError::Duplicate {
                key: ORDER_NUMBER_KEY,
                value,
            })) => {
                log::warn!("Order number {} taken at insert (attempt {})", value, attempt);
            }
            Err(AppError::Store(StoreError::Duplicate {
                key: PAYMENT_INTENT_KEY,
                value,
            })) => {
                log::warn!("Payment intent {} was committed by a concurrent order", value);
                return Err(AppError::PaymentVerificationFailed(
                    "payment intent already used".into(),
                ));
            }
            other => return other,
        }
    }
    Err(AppError::OrderNumberExhausted(max_attempts))
}

fn snapshot_items(quote: &Quote) -> Vec<OrderItem> {
    quote
        .lines
        .iter()
        .map(|line| OrderItem {
            product_id: line.product.id.clone(),
            name: line.product.name.clone(),
            price: from_cents(line.unit_cents),
            quantity: line.quantity,
            image: line.product.image.clone(),
        })
        .collect()
}

pub async fn place_order(
    store: &dyn Store,
    gateway: &dyn PaymentGateway,
    config: &CheckoutConfig,
    user: Option<&AuthUser>,
    input: PlaceOrderInput,
) -> Result<PlacedOrder, AppError> {
    place_order_numbered(store, gateway, config, user, input, generate_order_number).await
}

async fn place_order_numbered<G>(
    store: &dyn Store,
    gateway: &dyn PaymentGateway,
    config: &CheckoutConfig,
    user: Option<&AuthUser>,
    input: PlaceOrderInput,
    generate: G,
) -> Result<PlacedOrder, AppError>
where
    G: FnMut() -> String,
{
    let shipping = validate_shipping(&input.shipping)?;
    let lines = pricing::normalize_lines(&input.items, config)?;
    let intent_id = match input.payment_method {
        PaymentMethod::Card => Some(
            input
                .payment_intent_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    AppError::InvalidInput("payment_intent_id is required for card payments".into())
                })?
                .to_string(),
        ),
        PaymentMethod::Cod => None,
    };

    let user_id = user.map(|u| u.id.as_str());
    let held = pricing::held_quantities(store, user_id, config).await?;
    let quote = pricing::quote(store, config, &lines, &held).await?;

    let (status, payment_status) = match &intent_id {
        Some(id) => {
            payment::verify_payment(store, gateway, config, id, quote.total_cents).await?;
            (OrderStatus::Processing, PaymentStatus::Paid)
        }
        None => (OrderStatus::Pending, PaymentStatus::Pending),
    };

    let mut order = Order {
        id: Uuid::new_v4().to_string(),
        order_number: String::new(),
        user_id: user_id.map(str::to_string),
        shipping,
        items: snapshot_items(&quote),
        subtotal: from_cents(quote.subtotal_cents),
        shipping_fee: from_cents(quote.shipping_cents),
        total_amount: from_cents(quote.total_cents),
        currency: config.currency.clone(),
        status,
        payment_status,
        payment_method: input.payment_method,
        payment_intent_id: intent_id,
        created_at: Utc::now(),
    };

    commit_with_fresh_number(store, config, &mut order, generate).await?;
    log::info!(
        "Order {} placed: total={} {} method={:?} user={}",
        order.order_number,
        order.total_amount,
        order.currency,
        order.payment_method,
        order.user_id.as_deref().unwrap_or("guest")
    );

    Ok(PlacedOrder {
        order_number: order.order_number,
        total_amount: order.total_amount,
        status: order.status,
        payment_status: order.payment_status,
    })
}

/// Customers only see their own orders; anything else reads as not found.
pub async fn find_order(
    store: &dyn Store,
    user: &AuthUser,
    order_number: &str,
) -> Result<OrderView, AppError> {
    let order = store
        .find_order(order_number)
        .await?
        .filter(|o| user.is_admin() || o.user_id.as_deref() == Some(user.id.as_str()))
        .ok_or_else(|| AppError::NotFound("Order".into()))?;
    Ok(order.into())
}

pub async fn orders_for_user(store: &dyn Store, user_id: &str) -> Result<Vec<OrderView>, AppError> {
    Ok(store
        .orders_for_user(user_id)
        .await?
        .into_iter()
        .map(OrderView::from)
        .collect())
}

/// Moves an order along its fulfilment path. Cancelling returns the items to stock.
pub async fn update_order_status(
    store: &dyn Store,
    order_number: &str,
    next: OrderStatus,
) -> Result<OrderView, AppError> {
    retry_transient("Order status update", || {
        apply_order_status(store, order_number, next)
    })
    .await
}

async fn apply_order_status(
    store: &dyn Store,
    order_number: &str,
    next: OrderStatus,
) -> Result<OrderView, AppError> {
    let mut tx = store.begin().await?;
    let Some(mut order) = tx.order(order_number).await? else {
        rollback(tx).await;
        return Err(AppError::NotFound("Order".into()));
    };
    if !order.status.can_transition_to(next) {
        rollback(tx).await;
        return Err(AppError::InvalidTransition {
            from: format!("{:?}", order.status).to_uppercase(),
            to: format!("{:?}", next).to_uppercase(),
        });
    }

    if next == OrderStatus::Cancelled {
        for item in &order.items {
            if !tx.restock(&item.product_id, item.quantity).await? {
                log::warn!(
                    "Order {}: product {} no longer exists, {} units not restocked",
                    order_number,
                    item.product_id,
                    item.quantity
                );
            }
        }
    }
    let payment_status = match (next, order.payment_method) {
        (OrderStatus::Delivered, PaymentMethod::Cod) => PaymentStatus::Paid,
        _ => order.payment_status,
    };

    tx.set_order_status(order_number, next, payment_status).await?;
    tx.commit().await?;
    log::info!("Order {} moved {:?} -> {:?}", order_number, order.status, next);

    order.status = next;
    order.payment_status = payment_status;
    Ok(order.into())
}
