//! Returns stock held by reservations nobody refreshed in time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, StoreError};
use crate::models::StockReservation;
use crate::store::{retry_transient, Store};

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct ReapReport {
    pub reclaimed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Reclaim {
    Done,
    // deleted or refreshed by someone else since the sweep listed it
    Stale,
}

async fn reclaim_one(
    store: &dyn Store,
    listed: &StockReservation,
    now: DateTime<Utc>,
) -> Result<Reclaim, AppError> {
    let mut tx = store.begin().await?;
    let current = tx.reservation(&listed.product_id, &listed.user_id).await?;
    let Some(current) = current.filter(|r| r.is_expired(now)) else {
        tx.abort().await?;
        return Ok(Reclaim::Stale);
    };

    if !tx.restock(&current.product_id, current.quantity).await? {
        tx.abort().await?;
        return Err(AppError::ProductNotFound(current.product_id));
    }
    tx.delete_reservation(&current.product_id, &current.user_id)
        .await?;
    tx.commit().await?;
    Ok(Reclaim::Done)
}

/// One pass over every reservation that expired before `now`. Each row gets its
/// own transaction; a failing row is logged and the sweep moves on.
pub async fn reap_expired_reservations(
    store: &dyn Store,
    now: DateTime<Utc>,
) -> Result<ReapReport, StoreError> {
    let expired = store.expired_reservations(now).await?;
    let mut report = ReapReport::default();

    for reservation in &expired {
        let outcome =
            retry_transient("Reservation reclaim", || reclaim_one(store, reservation, now)).await;
        match outcome {
            Ok(Reclaim::Done) => {
                log::debug!(
                    "Reclaimed {} of {} from user {}",
                    reservation.quantity,
                    reservation.product_id,
                    reservation.user_id
                );
                report.reclaimed += 1;
            }
            Ok(Reclaim::Stale) => report.skipped += 1,
            Err(e) => {
                log::warn!(
                    "Failed to reclaim reservation {}/{}: {}",
                    reservation.product_id,
                    reservation.user_id,
                    e
                );
                report.failed += 1;
            }
        }
    }

    if !expired.is_empty() {
        log::info!(
            "Reservation sweep: reclaimed={} skipped={} failed={}",
            report.reclaimed,
            report.skipped,
            report.failed
        );
    }
    Ok(report)
}

/// Sweeps on a fixed interval for the lifetime of the server.
pub fn spawn(store: Arc<dyn Store>, every: Duration) -> actix_web::rt::task::JoinHandle<()> {
    log::info!("Reservation reaper running every {:?}", every);
    actix_web::rt::spawn(async move {
        let mut ticker = actix_web::rt::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = reap_expired_reservations(store.as_ref(), Utc::now()).await {
                log::error!("Reservation sweep failed: {}", e);
            }
        }
    })
}
