//! Error types for the checkout core.
//!
//! Layers have their own enums ([`StoreError`], [`GatewayError`]) which fold into
//! [`AppError`] with `?`. `AppError` is what handlers return; it renders as
//! `{"code": "...", "message": "..."}` and hides internal detail for 5xx responses.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    /// A unique index rejected a write. `key` names the indexed field.
    #[error("duplicate {key}: {value}")]
    Duplicate { key: &'static str, value: String },

    /// Lost a write race to a concurrent transaction; the whole unit may be retried.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("stored document is malformed: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Mongo(e) => e.contains_label(mongodb::error::TRANSIENT_TRANSACTION_ERROR),
            StoreError::Conflict(_) => true,
            StoreError::Duplicate { .. } | StoreError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("gateway response missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Login required")]
    Unauthorized,

    #[error("Permission denied")]
    Forbidden,

    #[error("Product not found: {0}")]
    ProductNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Unknown products: {}", .0.join(", "))]
    InvalidItems(Vec<String>),

    #[error("Insufficient stock for {product_id}: {available} available")]
    InsufficientStock { product_id: String, available: i64 },

    #[error("Out of stock: {product_id}")]
    OutOfStock { product_id: String },

    #[error("Payment verification failed: {0}")]
    PaymentVerificationFailed(String),

    #[error("Cannot change order status from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("could not allocate a unique order number after {0} attempts")]
    OrderNumberExhausted(u32),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Store(e) if e.is_transient())
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::ProductNotFound(_) => "product_not_found",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidItems(_) => "invalid_items",
            AppError::InsufficientStock { .. } => "insufficient_stock",
            AppError::OutOfStock { .. } => "out_of_stock",
            AppError::PaymentVerificationFailed(_) => "payment_verification_failed",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::Gateway(_) => "payment_gateway_error",
            AppError::OrderNumberExhausted(_) | AppError::Store(_) => "transaction_failed",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) | AppError::InvalidItems(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::ProductNotFound(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InsufficientStock { .. }
            | AppError::OutOfStock { .. }
            | AppError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AppError::PaymentVerificationFailed(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::Gateway(_) => StatusCode::BAD_GATEWAY,
            AppError::OrderNumberExhausted(_) | AppError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            AppError::Gateway(e) => {
                log::error!("Payment gateway error: {}", e);
                "Payment service unavailable".to_string()
            }
            AppError::Store(e) => {
                log::error!("Transaction failed: {}", e);
                "Transaction failed".to_string()
            }
            AppError::OrderNumberExhausted(_) => {
                log::error!("{}", self);
                "Transaction failed".to_string()
            }
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            message,
        })
    }
}
