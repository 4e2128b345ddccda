use std::sync::Arc;

use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use chrono::Utc;

use crate::config::CheckoutConfig;
use crate::error::AppError;
use crate::middleware::AuthMiddleware;
use crate::models::{
    AuthUser, CartLineInput, CartSyncInput, OrderStatusInput, PaymentIntentInput, PlaceOrderInput,
};
use crate::payment::{self, PaymentGateway};
use crate::store::Store;
use crate::{orders, reaper, reservations};

/// Shared handles for every worker.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub checkout: CheckoutConfig,
    pub reservation_ttl: chrono::Duration,
}

fn current_user(req: &HttpRequest) -> Option<AuthUser> {
    req.extensions().get::<AuthUser>().cloned()
}

fn require_user(req: &HttpRequest) -> Result<AuthUser, AppError> {
    current_user(req).ok_or(AppError::Unauthorized)
}

fn require_admin(req: &HttpRequest) -> Result<AuthUser, AppError> {
    let user = require_user(req)?;
    if !user.is_admin() {
        return Err(AppError::Forbidden);
    }
    Ok(user)
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json("ok")
}

async fn get_cart(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, AppError> {
    let user = require_user(&req)?;
    let cart = reservations::cart_for_user(state.store.as_ref(), &user.id).await?;
    Ok(HttpResponse::Ok().json(cart))
}

async fn upsert_cart_item(
    state: web::Data<AppState>,
    data: web::Json<CartLineInput>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let user = require_user(&req)?;
    let item = reservations::upsert_cart_item(
        state.store.as_ref(),
        &state.checkout,
        state.reservation_ttl,
        &user.id,
        &data.product_id,
        data.quantity,
    )
    .await?;

    match item {
        Some(item) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "product_id": item.product_id,
            "quantity": item.quantity,
        }))),
        None => Ok(HttpResponse::Ok().json("Product removed from cart successfully")),
    }
}

async fn sync_guest_cart(
    state: web::Data<AppState>,
    data: web::Json<CartSyncInput>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let user = require_user(&req)?;
    let summary = reservations::sync_guest_cart(
        state.store.as_ref(),
        &state.checkout,
        state.reservation_ttl,
        &user.id,
        &data.items,
    )
    .await?;
    Ok(HttpResponse::Ok().json(summary))
}

async fn remove_cart_item(
    state: web::Data<AppState>,
    product_id: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let user = require_user(&req)?;
    if reservations::remove_cart_item(state.store.as_ref(), &user.id, &product_id).await? {
        Ok(HttpResponse::Ok().json("Product removed from cart successfully"))
    } else {
        Ok(HttpResponse::NotFound().json("Product not found in cart"))
    }
}

async fn create_payment_intent(
    state: web::Data<AppState>,
    data: web::Json<PaymentIntentInput>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let user = current_user(&req);
    let intent = payment::create_payment_intent(
        state.store.as_ref(),
        state.gateway.as_ref(),
        &state.checkout,
        user.as_ref().map(|u| u.id.as_str()),
        &data.items,
    )
    .await?;
    Ok(HttpResponse::Created().json(intent))
}

async fn place_order(
    state: web::Data<AppState>,
    data: web::Json<PlaceOrderInput>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let user = current_user(&req);
    let placed = orders::place_order(
        state.store.as_ref(),
        state.gateway.as_ref(),
        &state.checkout,
        user.as_ref(),
        data.into_inner(),
    )
    .await?;
    Ok(HttpResponse::Created().json(placed))
}

async fn get_order(
    state: web::Data<AppState>,
    order_number: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let user = require_user(&req)?;
    let order = orders::find_order(state.store.as_ref(), &user, &order_number).await?;
    Ok(HttpResponse::Ok().json(order))
}

async fn my_orders(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, AppError> {
    let user = require_user(&req)?;
    let list = orders::orders_for_user(state.store.as_ref(), &user.id).await?;
    Ok(HttpResponse::Ok().json(list))
}

async fn update_order_status(
    state: web::Data<AppState>,
    order_number: web::Path<String>,
    data: web::Json<OrderStatusInput>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    require_admin(&req)?;
    let order =
        orders::update_order_status(state.store.as_ref(), &order_number, data.status).await?;
    Ok(HttpResponse::Ok().json(order))
}

async fn reap_reservations(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, AppError> {
    let admin = require_admin(&req)?;
    log::info!("Reservation sweep requested by {}", admin.id);
    let report = reaper::reap_expired_reservations(state.store.as_ref(), Utc::now()).await?;
    Ok(HttpResponse::Ok().json(report))
}

/// Mounts every route. Cart, order and admin scopes need a token; checkout also
/// serves guests.
pub fn configure(cfg: &mut web::ServiceConfig, jwt_secret: &str) {
    cfg.route("/health", web::get().to(health))
        .service(
            web::scope("/checkout")
                .wrap(AuthMiddleware::optional(jwt_secret.to_string()))
                .route("/payment-intent", web::post().to(create_payment_intent))
                .route("/orders", web::post().to(place_order)),
        )
        .service(
            web::scope("/cart")
                .wrap(AuthMiddleware::new(jwt_secret.to_string()))
                .route("", web::get().to(get_cart))
                .route("/items", web::put().to(upsert_cart_item))
                .route("/items/{product_id}", web::delete().to(remove_cart_item))
                .route("/sync", web::post().to(sync_guest_cart)),
        )
        .service(
            web::scope("/orders")
                .wrap(AuthMiddleware::new(jwt_secret.to_string()))
                .route("", web::get().to(my_orders))
                .route("/{order_number}", web::get().to(get_order)),
        )
        .service(
            web::scope("/admin")
                .wrap(AuthMiddleware::new(jwt_secret.to_string()))
                .route("/orders/{order_number}/status", web::put().to(update_order_status))
                .route("/reservations/reap", web::post().to(reap_reservations)),
        );
}

/// Rejects malformed JSON bodies with the same error shape as the rest of the API.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(64 * 1024)
        .error_handler(|err, _req| {
            actix_web::Error::from(AppError::InvalidInput(format!("Invalid request body: {}", err)))
        })
}
