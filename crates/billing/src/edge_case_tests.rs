// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge case tests for the billing subsystem
//!
//! Boundary conditions across:
//! - Webhook signatures (tolerance window, secret rotation, header parsing)
//! - Event classification (unusual but valid payloads)
//! - Provider search queries and the create-or-update policies
//! - Subscription status restriction rules
//! - Backend selection

#[cfg(test)]
mod signature_tests {
    use crate::signature::{sign_payload, verify_signature, DEFAULT_TOLERANCE_SECS};

    const SECRET: &str = "whsec_edge";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"customer.deleted","data":{"object":{"id":"cus_1"}}}"#;

    // =========================================================================
    // Delivery exactly at the tolerance boundary, in both directions
    // =========================================================================
    #[test]
    fn test_tolerance_boundary_past_and_future() {
        let header = sign_payload(PAYLOAD, SECRET, 1_000_000).unwrap();
        let tol = DEFAULT_TOLERANCE_SECS;

        assert!(verify_signature(PAYLOAD, &header, SECRET, 1_000_000 + tol, tol).is_ok());
        assert!(verify_signature(PAYLOAD, &header, SECRET, 1_000_000 - tol, tol).is_ok());
        assert!(verify_signature(PAYLOAD, &header, SECRET, 1_000_000 + tol + 1, tol).is_err());
        assert!(verify_signature(PAYLOAD, &header, SECRET, 1_000_000 - tol - 1, tol).is_err());
    }

    // =========================================================================
    // Header with whitespace around entries and unknown schemes
    // =========================================================================
    #[test]
    fn test_header_with_spaces_and_extra_schemes() {
        let valid = sign_payload(PAYLOAD, SECRET, 1_000_000).unwrap();
        let v1 = valid.split(",v1=").nth(1).unwrap();
        let header = format!("t=1000000, v0=abc, v1={} , x=1", v1);
        assert!(verify_signature(PAYLOAD, &header, SECRET, 1_000_000, 300).is_ok());
    }

    // =========================================================================
    // Secret is used verbatim, including its prefix
    // =========================================================================
    #[test]
    fn test_secret_prefix_is_significant() {
        let header = sign_payload(PAYLOAD, "edge", 1_000_000).unwrap();
        assert!(verify_signature(PAYLOAD, &header, SECRET, 1_000_000, 300).is_err());
    }

    // =========================================================================
    // Empty payload still has to be signed
    // =========================================================================
    #[test]
    fn test_empty_payload() {
        let header = sign_payload("", SECRET, 1_000_000).unwrap();
        assert!(verify_signature("", &header, SECRET, 1_000_000, 300).is_ok());
        assert!(verify_signature(" ", &header, SECRET, 1_000_000, 300).is_err());
    }
}

#[cfg(test)]
mod classification_tests {
    use crate::provider::{WebhookEvent, WebhookEventData};
    use crate::webhooks::{classify_event, WebhookAction};
    use registry_shared::SubscriptionStatus;
    use serde_json::json;

    fn event(type_: &str, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: "evt_edge".to_string(),
            type_: type_.to_string(),
            created: 0,
            data: WebhookEventData { object },
        }
    }

    // =========================================================================
    // Every provider status round-trips through classification
    // =========================================================================
    #[test]
    fn test_every_status_is_accepted_on_update() {
        for status in SubscriptionStatus::ALL {
            let action = classify_event(&event(
                "customer.subscription.updated",
                json!({"id": "sub_1", "status": status.as_str()}),
            ))
            .unwrap();
            assert_eq!(
                action,
                WebhookAction::UpdateStatus {
                    subscription_id: "sub_1".to_string(),
                    status,
                }
            );
        }
    }

    // =========================================================================
    // Non-string fields are treated as missing
    // =========================================================================
    #[test]
    fn test_non_string_fields_rejected() {
        let err = classify_event(&event(
            "checkout.session.completed",
            json!({"customer": 42, "status": "complete", "subscription": "sub_1"}),
        ));
        assert!(err.is_err());

        let err = classify_event(&event(
            "checkout.session.completed",
            json!({"customer": "cus_1", "status": "complete", "subscription": null}),
        ));
        assert!(err.is_err());
    }

    // =========================================================================
    // Expanded objects (subscription as an object) are not accepted
    // =========================================================================
    #[test]
    fn test_expanded_subscription_object_rejected() {
        let err = classify_event(&event(
            "checkout.session.completed",
            json!({"customer": "cus_1", "status": "complete", "subscription": {"id": "sub_1"}}),
        ));
        assert!(err.is_err());
    }

    // =========================================================================
    // Event types are matched exactly
    // =========================================================================
    #[test]
    fn test_event_type_case_sensitive() {
        let action = classify_event(&event("Customer.Deleted", json!({"id": "cus_1"}))).unwrap();
        assert!(matches!(action, WebhookAction::Ignore { .. }));
    }
}

#[cfg(test)]
mod provider_policy_tests {
    use crate::mock::MockBillingApi;
    use crate::provider::{parse_search_query, quote_search_value, BillingApi};
    use registry_shared::SubscriptionPriceInterval;

    // =========================================================================
    // Product names with quotes must not break the search query
    // =========================================================================
    #[tokio::test]
    async fn test_product_name_with_quotes() {
        let api = MockBillingApi::new("pk", "whsec");
        let name = r#"The "Best" Plan"#;
        let created = api.create_product(name, "", None).await.unwrap();

        let updated = api
            .create_or_update_product(name, "now with docs", None)
            .await
            .unwrap();
        assert_eq!(updated.id, created.id);
    }

    // =========================================================================
    // Deleted products are not candidates for update
    // =========================================================================
    #[tokio::test]
    async fn test_deleted_product_not_updated() {
        let api = MockBillingApi::new("pk", "whsec");
        let old = api.create_product("Plan", "", None).await.unwrap();
        api.delete_product(&old.id).await.unwrap();

        let fresh = api.create_or_update_product("Plan", "", None).await.unwrap();
        assert_ne!(fresh.id, old.id);
    }

    // =========================================================================
    // Re-creating a price twice leaves exactly one active price
    // =========================================================================
    #[tokio::test]
    async fn test_repeated_price_updates_keep_one_active() {
        let api = MockBillingApi::new("pk", "whsec");
        let product = api.create_product("Plan", "", None).await.unwrap();

        for amount in [1000, 2000, 3000] {
            api.create_or_update_price(
                amount,
                "usd",
                SubscriptionPriceInterval::Month,
                &product.id,
                None,
            )
            .await
            .unwrap();
        }

        let active = api
            .search_prices(
                &format!("active:\"true\" product:{}", quote_search_value(&product.id)),
                100,
            )
            .await
            .unwrap();
        assert_eq!(active.data.len(), 1);
        assert_eq!(active.data[0].unit_amount, Some(3000));
    }

    // =========================================================================
    // Unterminated quote consumes the rest of the query
    // =========================================================================
    #[test]
    fn test_unterminated_quote() {
        assert_eq!(
            parse_search_query(r#"name:"open ended"#),
            vec![("name".to_string(), "open ended".to_string())]
        );
    }
}

#[cfg(test)]
mod status_tests {
    use registry_shared::SubscriptionStatus;

    // =========================================================================
    // Only active and trialing subscriptions grant access
    // =========================================================================
    #[test]
    fn test_restriction_truth_table() {
        for status in SubscriptionStatus::ALL {
            let expected = !matches!(
                status,
                SubscriptionStatus::Active | SubscriptionStatus::Trialing
            );
            assert_eq!(status.is_restricted(), expected, "status {}", status);
        }
    }
}

#[cfg(test)]
mod backend_selection_tests {
    use crate::client::{BillingBackend, StripeConfig};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // =========================================================================
    // Backend names are case-insensitive; anything else is a config error
    // =========================================================================
    #[test]
    fn test_backend_names() {
        assert_eq!("MOCK".parse::<BillingBackend>().unwrap(), BillingBackend::Mock);
        assert!("paypal".parse::<BillingBackend>().is_err());
        assert!("".parse::<BillingBackend>().is_err());
    }

    // =========================================================================
    // Local backend without an API base cannot be configured
    // =========================================================================
    #[test]
    fn test_local_backend_requires_api_base() {
        let result = StripeConfig::from_lookup(lookup(&[
            ("BILLING_BACKEND", "local"),
            ("SUBSCRIPTION_SECRET_KEY", "sk_test"),
            ("SUBSCRIPTION_PUBLISHABLE_KEY", "pk_test"),
            ("SUBSCRIPTION_WEBHOOK_KEY", "whsec_test"),
        ]));
        assert!(result.is_err());
    }
}
