//! Billing error types

/// Errors raised by billing operations
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::WebhookEventNotSupported(format!("Malformed event payload: {}", e))
    }
}
