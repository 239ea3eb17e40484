//! Organization billing routes

use axum::{
    extract::{Path, State},
    Json,
};
use registry_shared::{Organization, SubscriptionStatus};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub portal_url: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub subscription_id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub status_label: &'static str,
    pub is_restricted: bool,
}

async fn load_organization(state: &AppState, org_id: Uuid) -> ApiResult<Organization> {
    state
        .billing
        .subscriptions
        .get_organization(org_id)
        .await?
        .ok_or(ApiError::NotFound)
}

/// POST /organizations/{org_id}/billing/checkout
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<CheckoutResponse>> {
    let organization = load_organization(&state, org_id).await?;
    let customer_id = state.billing.organization_customer(&organization).await?;

    let price = state.billing.default_checkout_price().await?;
    let price_id = price.price_id.ok_or(ApiError::Internal)?;

    let return_url = state.organization_billing_url(org_id);
    let session = state
        .billing
        .api
        .create_checkout_session(&customer_id, &price_id, &return_url, &return_url)
        .await?;

    tracing::info!(
        org_id = %org_id,
        customer_id = %customer_id,
        session_id = %session.id,
        "Checkout session created"
    );

    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

/// POST /organizations/{org_id}/billing/portal
pub async fn create_portal_session(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<PortalResponse>> {
    let organization = load_organization(&state, org_id).await?;
    let customer_id = organization.customer_id.ok_or_else(|| {
        ApiError::Validation("Organization has no billing customer".to_string())
    })?;

    let session = state
        .billing
        .api
        .create_portal_session(&customer_id, &state.organization_billing_url(org_id))
        .await?;

    Ok(Json(PortalResponse {
        portal_url: session.url,
    }))
}

/// GET /organizations/{org_id}/billing/subscriptions
pub async fn list_subscriptions(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<Vec<SubscriptionResponse>>> {
    load_organization(&state, org_id).await?;

    let subscriptions = state
        .billing
        .subscriptions
        .get_subscriptions_by_organization(org_id)
        .await?;

    Ok(Json(
        subscriptions
            .into_iter()
            .map(|s| SubscriptionResponse {
                id: s.id,
                is_restricted: s.is_restricted(),
                status_label: s.status.label(),
                subscription_id: s.subscription_id,
                customer_id: s.customer_id,
                status: s.status,
            })
            .collect(),
    ))
}
