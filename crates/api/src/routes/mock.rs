//! Local development stand-in for the provider's hosted checkout
//!
//! Answers 404 unless the mock backend is active.

use axum::{
    extract::{Path, State},
    Json,
};
use rand::Rng;
use registry_billing::{
    webhooks::CHECKOUT_SESSION_COMPLETED, WebhookEvent, WebhookEventData,
};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const MOCK_SUBSCRIPTION_PREFIX: &str = "mocksub_";

#[derive(Debug, Serialize)]
pub struct MockCheckoutResponse {
    pub subscription_id: String,
}

fn mock_subscription_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("{MOCK_SUBSCRIPTION_PREFIX}{suffix}")
}

fn checkout_completed_event(customer_id: &str, subscription_id: &str) -> WebhookEvent {
    WebhookEvent {
        id: format!("evt_mock_{}", Uuid::new_v4().simple()),
        type_: CHECKOUT_SESSION_COMPLETED.to_string(),
        created: time::OffsetDateTime::now_utc().unix_timestamp(),
        data: WebhookEventData {
            object: json!({
                "object": "checkout.session",
                "customer": customer_id,
                "status": "complete",
                "subscription": subscription_id,
            }),
        },
    }
}

/// POST /mock/billing/{org_id}/checkout-session-completed
pub async fn trigger_checkout_session_completed(
    State(state): State<AppState>,
    Path(org_id): Path<Uuid>,
) -> ApiResult<Json<MockCheckoutResponse>> {
    let mock = state.billing.mock.clone().ok_or(ApiError::NotFound)?;

    let organization = state
        .billing
        .subscriptions
        .get_organization(org_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let customer_id = organization.customer_id.ok_or_else(|| {
        ApiError::Validation("Organization has no billing customer".to_string())
    })?;

    let subscription_id = mock_subscription_id();
    let event = checkout_completed_event(&customer_id, &subscription_id);
    state.billing.webhooks.handle_event(&event).await?;
    mock.record_subscription(&subscription_id, &customer_id).await;

    tracing::info!(
        org_id = %org_id,
        subscription_id = %subscription_id,
        "Mock checkout completed"
    );

    Ok(Json(MockCheckoutResponse { subscription_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_billing::{classify_event, WebhookAction};

    #[test]
    fn test_mock_subscription_id_shape() {
        let id = mock_subscription_id();
        assert!(id.starts_with(MOCK_SUBSCRIPTION_PREFIX));
        let suffix = &id[MOCK_SUBSCRIPTION_PREFIX.len()..];
        assert_eq!(suffix.len(), 24);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, mock_subscription_id());
    }

    #[test]
    fn test_checkout_completed_event_classifies_as_checkout() {
        let event = checkout_completed_event("cus_1", "mocksub_abc");
        assert!(event.id.starts_with("evt_mock_"));
        assert_eq!(
            classify_event(&event).unwrap(),
            WebhookAction::CompleteCheckout {
                customer_id: "cus_1".to_string(),
                subscription_id: "mocksub_abc".to_string(),
            }
        );
    }
}
