//! Authoritative cart pricing shared by payment-intent creation and order placement.
//!
//! All arithmetic happens in integer minor units (cents) so the amount sent to the
//! gateway and the amount written on the order are the same number.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::CheckoutConfig;
use crate::error::AppError;
use crate::models::{CartLineInput, Product};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct PricedLine {
    pub product: Product,
    pub quantity: i64,
    pub unit_cents: i64,
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub lines: Vec<PricedLine>,
    pub subtotal_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
}

pub fn to_cents(price: Decimal) -> Option<i64> {
    (price * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub fn shipping_cents(subtotal_cents: i64, config: &CheckoutConfig) -> i64 {
    if subtotal_cents > config.free_shipping_threshold_cents {
        0
    } else {
        config.shipping_fee_cents
    }
}

/// Checks bounds and folds duplicate product ids into one line, keeping first-seen order.
pub fn normalize_lines(
    lines: &[CartLineInput],
    config: &CheckoutConfig,
) -> Result<Vec<CartLineInput>, AppError> {
    if lines.is_empty() {
        return Err(AppError::InvalidInput("Cart is empty".into()));
    }

    let mut merged: Vec<CartLineInput> = Vec::with_capacity(lines.len());
    for line in lines {
        let product_id = line.product_id.trim();
        if product_id.is_empty() {
            return Err(AppError::InvalidInput("Product id is required".into()));
        }
        check_quantity(line.quantity, config)?;
        match merged.iter_mut().find(|m| m.product_id == product_id) {
            Some(existing) => {
                existing.quantity += line.quantity;
                check_quantity(existing.quantity, config)?;
            }
            None => merged.push(CartLineInput {
                product_id: product_id.to_string(),
                quantity: line.quantity,
            }),
        }
    }

    if merged.len() > config.max_lines {
        return Err(AppError::InvalidInput(format!(
            "Too many cart lines (max {})",
            config.max_lines
        )));
    }
    Ok(merged)
}

pub fn check_quantity(quantity: i64, config: &CheckoutConfig) -> Result<(), AppError> {
    if quantity < 1 || quantity > config.max_line_quantity {
        return Err(AppError::InvalidInput(format!(
            "Quantity must be between 1 and {}",
            config.max_line_quantity
        )));
    }
    Ok(())
}

/// Stock the buyer already holds through reservations, by product id.
/// Empty for guests and when orders do not consume reservations.
pub async fn held_quantities(
    store: &dyn Store,
    user_id: Option<&str>,
    config: &CheckoutConfig,
) -> Result<HashMap<String, i64>, AppError> {
    match user_id {
        Some(user_id) if config.consume_reservations => Ok(store
            .reservations_for_user(user_id)
            .await?
            .into_iter()
            .map(|r| (r.product_id, r.quantity))
            .collect()),
        _ => Ok(HashMap::new()),
    }
}

/// Prices normalized lines against live product rows. Client prices never enter here.
pub async fn quote(
    store: &dyn Store,
    config: &CheckoutConfig,
    lines: &[CartLineInput],
    held: &HashMap<String, i64>,
) -> Result<Quote, AppError> {
    let ids: Vec<String> = lines.iter().map(|l| l.product_id.clone()).collect();
    let mut products: HashMap<String, Product> = store
        .find_products(&ids)
        .await?
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let missing: Vec<String> = ids
        .iter()
        .filter(|id| !products.contains_key(*id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(AppError::InvalidItems(missing));
    }

    let mut priced = Vec::with_capacity(lines.len());
    let mut subtotal_cents: i64 = 0;
    for line in lines {
        let Some(product) = products.remove(&line.product_id) else {
            return Err(AppError::InvalidItems(vec![line.product_id.clone()]));
        };
        let available = product.stock + held.get(&product.id).copied().unwrap_or(0);
        if line.quantity > available {
            return Err(AppError::OutOfStock {
                product_id: product.id,
            });
        }

        let unit_cents = to_cents(product.price)
            .filter(|c| *c >= 0)
            .ok_or_else(|| AppError::InvalidInput(format!("Product {} has no valid price", product.id)))?;
        subtotal_cents = unit_cents
            .checked_mul(line.quantity)
            .and_then(|line_total| subtotal_cents.checked_add(line_total))
            .ok_or_else(|| AppError::InvalidInput("Order total is too large".into()))?;

        priced.push(PricedLine {
            product,
            quantity: line.quantity,
            unit_cents,
        });
    }

    let shipping_cents = shipping_cents(subtotal_cents, config);
    Ok(Quote {
        lines: priced,
        subtotal_cents,
        shipping_cents,
        total_cents: subtotal_cents + shipping_cents,
    })
}
