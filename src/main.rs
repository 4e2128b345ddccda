use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};

mod config;
mod db;
mod error;
mod middleware;
mod models;
mod orders;
mod payment;
mod pricing;
mod reaper;
mod reservations;
mod routes;
mod store;
#[cfg(test)]
mod test_support;

use config::Config;
use payment::StripeGateway;
use routes::AppState;
use store::{MongoStore, Store};

fn startup_error(context: &str, e: impl std::fmt::Display) -> std::io::Error {
    log::error!("{}: {}", context, e);
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, e))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok(); // Load environment variables from .env file
    env_logger::init(); // Initialize the logger

    let config = Config::from_env().map_err(|e| startup_error("Invalid configuration", e))?;

    // Connect to the MongoDB database
    let (client, db) = db::connect(&config.database_url, &config.database_name)
        .await
        .map_err(|e| startup_error("Failed to connect to MongoDB", e))?;
    db::ensure_indexes(&db)
        .await
        .map_err(|e| startup_error("Failed to create indexes", e))?;
    let store: Arc<dyn Store> = Arc::new(MongoStore::new(client, &db));

    let gateway = StripeGateway::new(&config.gateway)
        .map_err(|e| startup_error("Failed to build payment gateway client", e))?;

    if let Some(every) = config.reaper_interval {
        reaper::spawn(store.clone(), every);
    }

    let state = AppState {
        store,
        gateway: Arc::new(gateway),
        checkout: config.checkout.clone(),
        reservation_ttl: config.reservation_ttl,
    };
    let jwt_secret = config.jwt_secret.clone();

    log::info!("Checkout service listening on {}", config.bind_addr);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone())) // Share the store and gateway with handlers
            .app_data(routes::json_config())
            .configure(|cfg| routes::configure(cfg, &jwt_secret))
    })
    .bind(&config.bind_addr)?
    .run()
    .await
}
