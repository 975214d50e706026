pub mod config;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod ports;
pub mod services;
pub mod store;
pub mod upstream;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::middleware::idempotency::{IdempotencyService, idempotency_middleware};
use crate::ports::{IdentityProvider, TransactionStore};
use crate::services::EscrowCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<EscrowCoordinator>,
    pub identity: Arc<dyn IdentityProvider>,
    pub store: Arc<dyn TransactionStore>,
}

pub fn create_app(state: AppState) -> Router {
    let idempotency = IdempotencyService::new();

    let payments = Router::new()
        .route("/payments/create-intent", post(handlers::payments::create_intent))
        .route("/payments/confirm", post(handlers::payments::confirm))
        .route("/payments/verify-handoff", post(handlers::payments::verify_handoff))
        .route("/payments/transaction/:id", get(handlers::payments::get_transaction))
        .layer(axum::middleware::from_fn_with_state(
            idempotency,
            idempotency_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(payments)
        .layer(axum::middleware::from_fn(
            middleware::request_logger::request_logger_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
