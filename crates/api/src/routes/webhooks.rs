//! Provider webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use registry_billing::WebhookOutcome;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// POST /billing/webhook
///
/// Signature failures and malformed events are answered with 400 so the
/// provider does not keep retrying them; anything else is a 5xx and will be
/// redelivered.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    let event = state.billing.webhooks.verify_event(&body, signature)?;
    let outcome = state.billing.webhooks.handle_event(&event).await?;

    Ok(Json(json!({
        "received": true,
        "duplicate": outcome == WebhookOutcome::Duplicate,
    })))
}
