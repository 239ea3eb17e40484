//! Webhook signature verification
//!
//! The provider signs every webhook delivery with HMAC-SHA256 over
//! `"{timestamp}.{payload}"` and sends the result in a header of the form
//! `t=1492774577,v1=5257a869...,v0=...`. Several `v1` entries may be present
//! while a signing secret is being rolled.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::provider::WebhookEvent;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verify a delivery against `secret` and parse the event
pub fn construct_event(payload: &str, sig_header: &str, secret: &str) -> BillingResult<WebhookEvent> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    verify_signature(payload, sig_header, secret, now, DEFAULT_TOLERANCE_SECS)?;

    let event: WebhookEvent = serde_json::from_str(payload).map_err(|e| {
        tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::WebhookSignatureInvalid
    })?;

    Ok(event)
}

/// Check a signature header at a given point in time
pub fn verify_signature(
    payload: &str,
    sig_header: &str,
    secret: &str,
    now: i64,
    tolerance_secs: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in sig_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if now.abs_diff(timestamp) > tolerance_secs.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Produce a signature header for `payload`, as the provider would
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    Ok(format!("t={},v1={}", timestamp, signature))
}
