//! HTTP routes

mod billing;
mod health;
mod mock;
mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use billing::{CheckoutResponse, PortalResponse, SubscriptionResponse};

/// Build the application router
///
/// Callers are expected to sit behind a gateway that has already
/// authorized access to the organization in the path.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/billing/webhook", post(webhooks::billing_webhook))
        .route(
            "/organizations/{org_id}/billing/checkout",
            post(billing::create_checkout_session),
        )
        .route(
            "/organizations/{org_id}/billing/portal",
            post(billing::create_portal_session),
        )
        .route(
            "/organizations/{org_id}/billing/subscriptions",
            get(billing::list_subscriptions),
        )
        .route(
            "/mock/billing/{org_id}/checkout-session-completed",
            post(mock::trigger_checkout_session_completed),
        )
        .with_state(state)
}
