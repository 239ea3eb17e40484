//! API error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use registry_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found")]
    NotFound,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Payment provider error: {0}")]
    Provider(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error")]
    Internal,
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookEventNotSupported(msg) => ApiError::BadRequest(msg),
            BillingError::StripeApi(msg) => ApiError::Provider(msg),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) | BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Billing internal error");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            ApiError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Provider(msg) => {
                tracing::error!(error = %msg, "Payment provider request failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "Payment provider request failed".to_string(),
                )
            }
            ApiError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_error_mapping() {
        assert!(matches!(
            ApiError::from(BillingError::NotFound("x".into())),
            ApiError::NotFound
        ));
        assert!(matches!(
            ApiError::from(BillingError::WebhookSignatureInvalid),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(BillingError::Config("x".into())),
            ApiError::Internal
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ApiError::BadRequest("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Validation("nope".into()).into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::Database("secret".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
