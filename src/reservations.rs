//! Cart mutations and the stock holds behind them.
//!
//! The quantity on a user's reservation row is exactly the stock held for that
//! cart line. Every mutation compares the requested quantity with that hold and
//! moves only the difference in or out of `Product.stock`.

use std::collections::HashMap;

use chrono::{Duration, Utc};

use crate::config::CheckoutConfig;
use crate::error::AppError;
use crate::models::{CartItem, CartLineInput, CartLineView, CartSyncSummary, StockReservation};
use crate::pricing::check_quantity;
use crate::store::{retry_transient, Store, Transaction};

enum LineOutcome {
    Applied(CartItem),
    UnknownProduct,
    Insufficient { available: i64 },
}

/// Moves stock for one line inside an open transaction. Writes nothing unless it
/// returns `Applied`.
async fn apply_line(
    tx: &mut dyn Transaction,
    ttl: Duration,
    user_id: &str,
    product_id: &str,
    target: i64,
) -> Result<LineOutcome, AppError> {
    let Some(product) = tx.product(product_id).await? else {
        return Ok(LineOutcome::UnknownProduct);
    };
    let held = tx
        .reservation(product_id, user_id)
        .await?
        .map(|r| r.quantity)
        .unwrap_or(0);

    let delta = target - held;
    if delta > 0 {
        if !tx.take_stock(product_id, delta).await? {
            return Ok(LineOutcome::Insufficient {
                available: product.stock,
            });
        }
    } else if delta < 0 {
        tx.restock(product_id, -delta).await?;
    }

    let now = Utc::now();
    let item = CartItem {
        user_id: user_id.to_string(),
        product_id: product_id.to_string(),
        quantity: target,
        updated_at: now,
    };
    tx.put_cart_item(&item).await?;
    tx.put_reservation(&StockReservation {
        product_id: product_id.to_string(),
        user_id: user_id.to_string(),
        quantity: target,
        expires_at: now + ttl,
    })
    .await?;
    Ok(LineOutcome::Applied(item))
}

/// Sets the cart quantity for one product. A quantity below 1 removes the line
/// and yields `None`.
pub async fn upsert_cart_item(
    store: &dyn Store,
    config: &CheckoutConfig,
    ttl: Duration,
    user_id: &str,
    product_id: &str,
    quantity: i64,
) -> Result<Option<CartItem>, AppError> {
    if quantity < 1 {
        remove_cart_item(store, user_id, product_id).await?;
        return Ok(None);
    }
    check_quantity(quantity, config)?;
    retry_transient("Cart update", || {
        set_line(store, ttl, user_id, product_id, quantity)
    })
    .await
}

async fn set_line(
    store: &dyn Store,
    ttl: Duration,
    user_id: &str,
    product_id: &str,
    quantity: i64,
) -> Result<Option<CartItem>, AppError> {
    let mut tx = store.begin().await?;
    match apply_line(tx.as_mut(), ttl, user_id, product_id, quantity).await? {
        LineOutcome::Applied(item) => {
            tx.commit().await?;
            log::info!(
                "Cart line set: user={} product={} quantity={}",
                user_id,
                product_id,
                quantity
            );
            Ok(Some(item))
        }
        LineOutcome::UnknownProduct => {
            tx.abort().await?;
            Err(AppError::ProductNotFound(product_id.to_string()))
        }
        LineOutcome::Insufficient { available } => {
            tx.abort().await?;
            Err(AppError::InsufficientStock {
                product_id: product_id.to_string(),
                available,
            })
        }
    }
}

/// Applies a guest cart to a signed-in user's cart in one transaction, skipping
/// lines that cannot be honoured instead of failing the whole batch.
pub async fn sync_guest_cart(
    store: &dyn Store,
    config: &CheckoutConfig,
    ttl: Duration,
    user_id: &str,
    items: &[CartLineInput],
) -> Result<CartSyncSummary, AppError> {
    retry_transient("Guest cart sync", || {
        sync_lines(store, config, ttl, user_id, items)
    })
    .await
}

async fn sync_lines(
    store: &dyn Store,
    config: &CheckoutConfig,
    ttl: Duration,
    user_id: &str,
    items: &[CartLineInput],
) -> Result<CartSyncSummary, AppError> {
    let mut summary = CartSyncSummary {
        applied: 0,
        skipped: 0,
    };
    let mut tx = store.begin().await?;

    for item in items {
        if check_quantity(item.quantity, config).is_err() {
            log::debug!("Skipping cart line {} with quantity {}", item.product_id, item.quantity);
            summary.skipped += 1;
            continue;
        }
        match apply_line(tx.as_mut(), ttl, user_id, &item.product_id, item.quantity).await? {
            LineOutcome::Applied(_) => summary.applied += 1,
            LineOutcome::UnknownProduct => {
                log::debug!("Skipping stale cart line for unknown product {}", item.product_id);
                summary.skipped += 1;
            }
            LineOutcome::Insufficient { available } => {
                log::warn!(
                    "Skipping cart line {}: wanted {}, {} available",
                    item.product_id,
                    item.quantity,
                    available
                );
                summary.skipped += 1;
            }
        }
    }

    tx.commit().await?;
    log::info!(
        "Guest cart synced for user={}: applied={} skipped={}",
        user_id,
        summary.applied,
        summary.skipped
    );
    Ok(summary)
}

/// Deletes the cart line and its reservation, returning the held stock.
/// Returns `false` when there was nothing to remove.
pub async fn remove_cart_item(
    store: &dyn Store,
    user_id: &str,
    product_id: &str,
) -> Result<bool, AppError> {
    retry_transient("Cart removal", || drop_line(store, user_id, product_id)).await
}

async fn drop_line(store: &dyn Store, user_id: &str, product_id: &str) -> Result<bool, AppError> {
    let mut tx = store.begin().await?;

    let held = tx
        .reservation(product_id, user_id)
        .await?
        .map(|r| r.quantity)
        .unwrap_or(0);
    let had_reservation = tx.delete_reservation(product_id, user_id).await?;
    let had_line = tx.delete_cart_item(user_id, product_id).await?;
    if held > 0 && !tx.restock(product_id, held).await? {
        log::warn!(
            "Product {} is gone; dropped hold of {} without restocking",
            product_id,
            held
        );
    }

    tx.commit().await?;
    if had_line || had_reservation {
        log::info!("Cart line removed: user={} product={}", user_id, product_id);
    }
    Ok(had_line || had_reservation)
}

/// The user's cart joined with live product data. Lines whose product has been
/// deleted are left out.
pub async fn cart_for_user(store: &dyn Store, user_id: &str) -> Result<Vec<CartLineView>, AppError> {
    let items = store.cart_for_user(user_id).await?;
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = items.iter().map(|i| i.product_id.clone()).collect();
    let products: HashMap<_, _> = store
        .find_products(&ids)
        .await?
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();
    let holds: HashMap<_, _> = store
        .reservations_for_user(user_id)
        .await?
        .into_iter()
        .map(|r| (r.product_id.clone(), r.expires_at))
        .collect();

    Ok(items
        .into_iter()
        .filter_map(|item| {
            let product = products.get(&item.product_id)?;
            Some(CartLineView {
                name: product.name.clone(),
                price: product.price,
                quantity: item.quantity,
                reserved_until: holds.get(&item.product_id).copied(),
                product_id: item.product_id,
            })
        })
        .collect())
}
