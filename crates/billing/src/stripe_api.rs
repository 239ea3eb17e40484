//! Provider REST API backend
//!
//! Requests go through the `async-stripe` client (auth, base URL, form
//! encoding) but responses are decoded into the provider types from
//! [`crate::provider`] so that only the fields we use have to be present.
//! The same backend serves the live API and a local stripe-mock endpoint;
//! the difference is the base URL chosen in [`StripeClient::new`].

use async_trait::async_trait;
use registry_shared::SubscriptionPriceInterval;
use serde::{Deserialize, Serialize};

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::provider::{
    BillingApi, CheckoutSession, DeletedObject, PortalSession, ProviderCustomer, ProviderList,
    ProviderPrice, ProviderProduct,
};

#[derive(Debug, Serialize)]
struct CreateCustomerParams<'a> {
    name: &'a str,
    description: &'a str,
}

#[derive(Debug, Serialize)]
struct ExpandParams<'a> {
    expand: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct CheckoutLineItem<'a> {
    price: &'a str,
    quantity: u64,
}

#[derive(Debug, Serialize)]
struct CreateCheckoutSessionParams<'a> {
    customer: &'a str,
    success_url: String,
    cancel_url: &'a str,
    mode: &'static str,
    line_items: Vec<CheckoutLineItem<'a>>,
}

#[derive(Debug, Serialize)]
struct CreatePortalSessionParams<'a> {
    customer: &'a str,
    return_url: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateProductParams<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tax_code: Option<&'a str>,
}

/// An empty description is sent so that the provider clears it
#[derive(Debug, Serialize)]
struct UpdateProductParams<'a> {
    name: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tax_code: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RecurringParams {
    interval: &'static str,
}

#[derive(Debug, Serialize)]
struct CreatePriceParams<'a> {
    unit_amount: i64,
    currency: &'a str,
    recurring: RecurringParams,
    product: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tax_behavior: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct UpdatePriceParams {
    active: bool,
}

#[derive(Debug, Serialize)]
struct ListParams {
    limit: u32,
}

#[derive(Debug, Serialize)]
struct SearchParams<'a> {
    query: &'a str,
    limit: u32,
}

const CHECKOUT_SESSION_EXPAND: &[&str] = &["customer", "line_items", "subscription"];

/// Subscription with its customer expanded
#[derive(Debug, Deserialize)]
struct SubscriptionWithCustomer {
    customer: ProviderCustomer,
}

/// Billing backend that calls the provider REST API
#[derive(Clone)]
pub struct StripeBillingApi {
    stripe: StripeClient,
}

impl StripeBillingApi {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }
}

#[async_trait]
impl BillingApi for StripeBillingApi {
    fn name(&self) -> &'static str {
        self.stripe.config().backend.as_str()
    }

    fn publishable_key(&self) -> &str {
        &self.stripe.config().publishable_key
    }

    fn webhook_secret(&self) -> &str {
        &self.stripe.config().webhook_secret
    }

    async fn get_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let session = self
            .stripe
            .inner()
            .get_query::<CheckoutSession, _>(
                &format!("/checkout/sessions/{}", session_id),
                ExpandParams {
                    expand: CHECKOUT_SESSION_EXPAND,
                },
            )
            .await?;
        Ok(session)
    }

    async fn get_customer(&self, subscription_id: &str) -> BillingResult<ProviderCustomer> {
        let subscription = self
            .stripe
            .inner()
            .get_query::<SubscriptionWithCustomer, _>(
                &format!("/subscriptions/{}", subscription_id),
                ExpandParams {
                    expand: &["customer"],
                },
            )
            .await?;
        Ok(subscription.customer)
    }

    async fn create_customer(&self, name: &str, description: &str) -> BillingResult<ProviderCustomer> {
        let customer = self
            .stripe
            .inner()
            .post_form::<ProviderCustomer, _>("/customers", CreateCustomerParams { name, description })
            .await?;

        tracing::info!(customer_id = %customer.id, "Created billing customer");
        Ok(customer)
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSession> {
        let params = CreateCheckoutSessionParams {
            customer: customer_id,
            success_url: format!("{}?session_id={{CHECKOUT_SESSION_ID}}", success_url),
            cancel_url,
            mode: "subscription",
            line_items: vec![CheckoutLineItem {
                price: price_id,
                quantity: 1,
            }],
        };

        let session = self
            .stripe
            .inner()
            .post_form::<CheckoutSession, _>("/checkout/sessions", params)
            .await?;

        tracing::info!(
            customer_id = %customer_id,
            session_id = %session.id,
            "Created checkout session"
        );
        Ok(session)
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<PortalSession> {
        let session = self
            .stripe
            .inner()
            .post_form::<PortalSession, _>(
                "/billing_portal/sessions",
                CreatePortalSessionParams {
                    customer: customer_id,
                    return_url,
                },
            )
            .await?;

        tracing::info!(customer_id = %customer_id, "Created billing portal session");
        Ok(session)
    }

    async fn create_product(
        &self,
        name: &str,
        description: &str,
        tax_code: Option<&str>,
    ) -> BillingResult<ProviderProduct> {
        let product = self
            .stripe
            .inner()
            .post_form::<ProviderProduct, _>(
                "/products",
                CreateProductParams {
                    name,
                    description,
                    tax_code,
                },
            )
            .await?;
        Ok(product)
    }

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct> {
        let product = self
            .stripe
            .inner()
            .get::<ProviderProduct>(&format!("/products/{}", product_id))
            .await?;
        Ok(product)
    }

    async fn update_product(
        &self,
        product_id: &str,
        name: &str,
        description: &str,
        tax_code: Option<&str>,
    ) -> BillingResult<ProviderProduct> {
        let product = self
            .stripe
            .inner()
            .post_form::<ProviderProduct, _>(
                &format!("/products/{}", product_id),
                UpdateProductParams {
                    name,
                    description,
                    tax_code,
                },
            )
            .await?;
        Ok(product)
    }

    async fn list_all_products(&self, limit: u32) -> BillingResult<ProviderList<ProviderProduct>> {
        let products = self
            .stripe
            .inner()
            .get_query::<ProviderList<ProviderProduct>, _>("/products", ListParams { limit })
            .await?;
        Ok(products)
    }

    async fn delete_product(&self, product_id: &str) -> BillingResult<DeletedObject> {
        let deleted = self
            .stripe
            .inner()
            .delete::<DeletedObject>(&format!("/products/{}", product_id))
            .await?;
        Ok(deleted)
    }

    async fn search_products(
        &self,
        query: &str,
        limit: u32,
    ) -> BillingResult<ProviderList<ProviderProduct>> {
        let products = self
            .stripe
            .inner()
            .get_query::<ProviderList<ProviderProduct>, _>(
                "/products/search",
                SearchParams { query, limit },
            )
            .await?;
        Ok(products)
    }

    async fn create_price(
        &self,
        unit_amount: i64,
        currency: &str,
        recurring: SubscriptionPriceInterval,
        product_id: &str,
        tax_behavior: Option<&str>,
    ) -> BillingResult<ProviderPrice> {
        let price = self
            .stripe
            .inner()
            .post_form::<ProviderPrice, _>(
                "/prices",
                CreatePriceParams {
                    unit_amount,
                    currency,
                    recurring: RecurringParams {
                        interval: recurring.as_str(),
                    },
                    product: product_id,
                    tax_behavior,
                },
            )
            .await?;
        Ok(price)
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<ProviderPrice> {
        let price = self
            .stripe
            .inner()
            .get::<ProviderPrice>(&format!("/prices/{}", price_id))
            .await?;
        Ok(price)
    }

    async fn update_price(&self, price_id: &str, active: bool) -> BillingResult<ProviderPrice> {
        let price = self
            .stripe
            .inner()
            .post_form::<ProviderPrice, _>(
                &format!("/prices/{}", price_id),
                UpdatePriceParams { active },
            )
            .await?;
        Ok(price)
    }

    async fn list_all_prices(&self, limit: u32) -> BillingResult<ProviderList<ProviderPrice>> {
        let prices = self
            .stripe
            .inner()
            .get_query::<ProviderList<ProviderPrice>, _>("/prices", ListParams { limit })
            .await?;
        Ok(prices)
    }

    async fn search_prices(
        &self,
        query: &str,
        limit: u32,
    ) -> BillingResult<ProviderList<ProviderPrice>> {
        let prices = self
            .stripe
            .inner()
            .get_query::<ProviderList<ProviderPrice>, _>(
                "/prices/search",
                SearchParams { query, limit },
            )
            .await?;
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BillingBackend, StripeConfig};

    fn config(backend: BillingBackend, api_base: Option<&str>) -> StripeConfig {
        StripeConfig {
            backend,
            api_base: api_base.map(str::to_string),
            api_version: crate::client::client_api_version().to_string(),
            secret_key: "sk_test_123".to_string(),
            publishable_key: "pk_test_123".to_string(),
            webhook_secret: "whsec_123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_basic_init() {
        let api = StripeBillingApi::new(StripeClient::new(config(BillingBackend::Stripe, None)));
        assert_eq!(api.name(), "stripe");
        assert_eq!(api.publishable_key(), "pk_test_123");
        assert_eq!(api.webhook_secret(), "whsec_123");
    }

    #[tokio::test]
    async fn test_local_backend_keeps_api_base() {
        let api = StripeBillingApi::new(StripeClient::new(config(
            BillingBackend::Local,
            Some("http://stripe:12111"),
        )));
        assert_eq!(api.name(), "local");
        assert_eq!(
            api.stripe().config().api_base.as_deref(),
            Some("http://stripe:12111")
        );
    }

    #[tokio::test]
    async fn test_webhook_received_uses_configured_secret() {
        let api = StripeBillingApi::new(StripeClient::new(config(BillingBackend::Stripe, None)));
        let payload = r#"{"id":"evt_1","type":"customer.deleted","data":{"object":{"id":"cus_1"}}}"#;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let header = crate::signature::sign_payload(payload, "whsec_123", now).unwrap();
        assert_eq!(api.webhook_received(payload, &header).unwrap().id, "evt_1");

        let header = crate::signature::sign_payload(payload, "whsec_wrong", now).unwrap();
        assert!(api.webhook_received(payload, &header).is_err());
    }

    #[test]
    fn test_checkout_params_shape() {
        let params = CreateCheckoutSessionParams {
            customer: "cus_123",
            success_url: format!("{}?session_id={{CHECKOUT_SESSION_ID}}", "http://what.ever"),
            cancel_url: "http://no.way",
            mode: "subscription",
            line_items: vec![CheckoutLineItem {
                price: "price_123",
                quantity: 1,
            }],
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(
            json["success_url"],
            "http://what.ever?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(json["line_items"][0]["quantity"], 1);
        assert_eq!(json["mode"], "subscription");
    }

    #[test]
    fn test_product_update_sends_empty_description() {
        let json = serde_json::to_value(UpdateProductParams {
            name: "Widgets",
            description: "",
            tax_code: None,
        })
        .unwrap();
        assert_eq!(json["description"], "");
        assert!(json.get("tax_code").is_none());

        let json = serde_json::to_value(CreateProductParams {
            name: "Widgets",
            description: "",
            tax_code: None,
        })
        .unwrap();
        assert!(json.get("description").is_none());
    }

    #[test]
    fn test_checkout_session_expands_references() {
        let json = serde_json::to_value(ExpandParams {
            expand: CHECKOUT_SESSION_EXPAND,
        })
        .unwrap();
        assert_eq!(
            json["expand"],
            serde_json::json!(["customer", "line_items", "subscription"])
        );
    }
}
