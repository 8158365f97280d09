pub mod auth;
pub mod billing;
pub mod stripe;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Authenticated billing callables, nested under `/api/billing`.
pub fn billing_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(billing::create_checkout_session))
        .route("/key", get(billing::get_user_key))
        .route("/portal", post(billing::create_customer_portal))
        .route("/me", get(billing::get_user_data))
        .route("/bootstrap", post(billing::bootstrap_user))
}

/// Gateway webhooks, nested under `/api/stripe`. Authenticated by signature only.
pub fn stripe_routes() -> Router<AppState> {
    Router::new().route("/webhook", post(stripe::webhook))
}
