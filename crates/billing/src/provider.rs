//! Billing provider capability
//!
//! Everything the application needs from the payment provider goes through
//! [`BillingApi`]. The live and local backends talk to the provider REST API
//! (see [`crate::stripe_api`]); the mock backend keeps everything in memory
//! (see [`crate::mock`]). The create-or-update and sync policies are provided
//! methods, so every backend shares them.

use async_trait::async_trait;
use registry_shared::SubscriptionPriceInterval;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::models::{SubscriptionPrice, SubscriptionProduct};
use crate::signature;

/// Default page size for list and search calls (provider accepts 1..=100)
pub const DEFAULT_LIST_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProduct {
    pub id: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tax_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecurring {
    pub interval: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPrice {
    pub id: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub recurring: Option<ProviderRecurring>,
    #[serde(default)]
    pub tax_behavior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Reference that the provider returns either as a bare id or, when
/// expanded, as the full object
#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Expandable>::deserialize(deserializer)?.map(|reference| match reference {
        Expandable::Id(id) | Expandable::Object { id } => id,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub line_items: Option<ProviderList<CheckoutSessionLineItem>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSessionLineItem {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub price: Option<String>,
    #[serde(default)]
    pub quantity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalSession {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedObject {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

/// One page of a list or search call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderList<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

/// Provider-to-application notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// Escape a value for use inside a double-quoted search clause
pub fn quote_search_value(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Split a search query into `field:"value"` clauses
///
/// Only the subset the application emits is understood: whitespace separated
/// clauses with single or double quoted values.
pub fn parse_search_query(query: &str) -> Vec<(String, String)> {
    let mut clauses = Vec::new();
    let mut chars = query.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut field = String::new();
        while let Some(&c) = chars.peek() {
            if c == ':' || c.is_whitespace() {
                break;
            }
            field.push(c);
            chars.next();
        }

        if chars.next() != Some(':') {
            break;
        }

        let mut value = String::new();
        match chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        c if c == quote => break,
                        c => value.push(c),
                    }
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }

        clauses.push((field, value));
    }

    clauses
}

/// Payment provider operations used by the billing subsystem
#[async_trait]
pub trait BillingApi: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Key handed to browsers for provider-hosted pages
    fn publishable_key(&self) -> &str;

    fn webhook_secret(&self) -> &str;

    /// Fetch the checkout session referenced by the success page
    async fn get_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession>;

    /// Fetch the customer attached to a subscription
    async fn get_customer(&self, subscription_id: &str) -> BillingResult<ProviderCustomer>;

    async fn create_customer(&self, name: &str, description: &str) -> BillingResult<ProviderCustomer>;

    /// Start a provider-hosted checkout for one unit of `price_id`
    ///
    /// The provider substitutes `{CHECKOUT_SESSION_ID}` in the success URL.
    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<CheckoutSession>;

    /// Start a provider-hosted session where the customer manages billing
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<PortalSession>;

    /// Verify a webhook delivery and parse the event
    fn webhook_received(&self, payload: &str, sig_header: &str) -> BillingResult<WebhookEvent> {
        signature::construct_event(payload, sig_header, self.webhook_secret())
    }

    async fn create_product(
        &self,
        name: &str,
        description: &str,
        tax_code: Option<&str>,
    ) -> BillingResult<ProviderProduct>;

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct>;

    async fn update_product(
        &self,
        product_id: &str,
        name: &str,
        description: &str,
        tax_code: Option<&str>,
    ) -> BillingResult<ProviderProduct>;

    async fn list_all_products(&self, limit: u32) -> BillingResult<ProviderList<ProviderProduct>>;

    async fn delete_product(&self, product_id: &str) -> BillingResult<DeletedObject>;

    /// Search products, e.g. `active:"true" name:"Widgets"`
    async fn search_products(
        &self,
        query: &str,
        limit: u32,
    ) -> BillingResult<ProviderList<ProviderProduct>>;

    async fn create_price(
        &self,
        unit_amount: i64,
        currency: &str,
        recurring: SubscriptionPriceInterval,
        product_id: &str,
        tax_behavior: Option<&str>,
    ) -> BillingResult<ProviderPrice>;

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<ProviderPrice>;

    async fn update_price(&self, price_id: &str, active: bool) -> BillingResult<ProviderPrice>;

    async fn list_all_prices(&self, limit: u32) -> BillingResult<ProviderList<ProviderPrice>>;

    /// Search prices, e.g. `active:"true" product:"prod_123"`
    async fn search_prices(&self, query: &str, limit: u32)
        -> BillingResult<ProviderList<ProviderPrice>>;

    /// Update the newest active product with this name, or create one
    async fn create_or_update_product(
        &self,
        name: &str,
        description: &str,
        tax_code: Option<&str>,
    ) -> BillingResult<ProviderProduct> {
        let query = format!("active:\"true\" name:{}", quote_search_value(name));
        let found = self.search_products(&query, DEFAULT_LIST_LIMIT).await?;

        match found.data.into_iter().max_by_key(|p| p.created) {
            Some(existing) => {
                tracing::debug!(product_id = %existing.id, name = %name, "Updating existing product");
                self.update_product(&existing.id, name, description, tax_code)
                    .await
            }
            None => {
                tracing::debug!(name = %name, "Creating product");
                self.create_product(name, description, tax_code).await
            }
        }
    }

    /// Deactivate every active price for the product and currency, then create a new one
    async fn create_or_update_price(
        &self,
        unit_amount: i64,
        currency: &str,
        recurring: SubscriptionPriceInterval,
        product_id: &str,
        tax_behavior: Option<&str>,
    ) -> BillingResult<ProviderPrice> {
        let query = format!(
            "active:\"true\" product:{} currency:{}",
            quote_search_value(product_id),
            quote_search_value(currency)
        );
        let existing = self.search_prices(&query, DEFAULT_LIST_LIMIT).await?;

        for price in existing.data {
            tracing::debug!(price_id = %price.id, "Deactivating superseded price");
            self.update_price(&price.id, false).await?;
        }

        self.create_price(unit_amount, currency, recurring, product_id, tax_behavior)
            .await
    }

    /// Push a local product to the provider and record the provider id on it
    async fn sync_product(&self, product: &mut SubscriptionProduct) -> BillingResult<()> {
        let synced = self
            .create_or_update_product(
                &product.product_name,
                &product.description,
                product.tax_code.as_deref(),
            )
            .await?;
        product.product_id = Some(synced.id);
        Ok(())
    }

    /// Push a local price to the provider and record the provider id on it
    async fn sync_price(
        &self,
        price: &mut SubscriptionPrice,
        product: &SubscriptionProduct,
    ) -> BillingResult<()> {
        let product_id = product.product_id.as_deref().ok_or_else(|| {
            BillingError::InvalidInput(format!(
                "Product {} must be synced before its prices",
                product.id
            ))
        })?;

        let synced = self
            .create_or_update_price(
                i64::from(price.unit_amount),
                &price.currency,
                price.recurring,
                product_id,
                price.tax_behavior.as_deref(),
            )
            .await?;
        price.price_id = Some(synced.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_session_accepts_expanded_references() {
        let session: CheckoutSession = serde_json::from_value(serde_json::json!({
            "id": "cs_123",
            "customer": {"id": "cus_123", "object": "customer", "name": "acme"},
            "subscription": {"id": "sub_123", "object": "subscription", "status": "active"},
            "status": "complete",
            "line_items": {
                "object": "list",
                "data": [{
                    "id": "li_123",
                    "price": {"id": "price_123", "object": "price", "unit_amount": 5000},
                    "quantity": 1,
                }],
                "has_more": false,
            },
        }))
        .unwrap();

        assert_eq!(session.customer.as_deref(), Some("cus_123"));
        assert_eq!(session.subscription.as_deref(), Some("sub_123"));
        let line_items = session.line_items.unwrap().data;
        assert_eq!(line_items[0].price.as_deref(), Some("price_123"));
        assert_eq!(line_items[0].quantity, Some(1));
    }

    #[test]
    fn test_checkout_session_accepts_bare_references() {
        let session: CheckoutSession = serde_json::from_value(serde_json::json!({
            "id": "cs_123",
            "customer": "cus_123",
            "subscription": null,
        }))
        .unwrap();

        assert_eq!(session.customer.as_deref(), Some("cus_123"));
        assert_eq!(session.subscription, None);
        assert_eq!(session.line_items, None);
    }

    #[test]
    fn test_parse_search_query() {
        let clauses = parse_search_query(r#"active:"true" name:"Vitamin PyPI" currency:'usd'"#);
        assert_eq!(
            clauses,
            vec![
                ("active".to_string(), "true".to_string()),
                ("name".to_string(), "Vitamin PyPI".to_string()),
                ("currency".to_string(), "usd".to_string()),
            ]
        );
    }

    #[test]
    fn test_quoted_values_round_trip() {
        let name = r#"Say "hi" \ bye"#;
        let query = format!("name:{}", quote_search_value(name));
        assert_eq!(
            parse_search_query(&query),
            vec![("name".to_string(), name.to_string())]
        );
    }

    #[test]
    fn test_parse_search_query_unquoted_and_garbage() {
        assert_eq!(
            parse_search_query("active:true"),
            vec![("active".to_string(), "true".to_string())]
        );
        assert!(parse_search_query("").is_empty());
        assert!(parse_search_query("nonsense").is_empty());
    }

    #[test]
    fn test_webhook_event_deserializes_provider_shape() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{
                "id": "evt_1",
                "object": "event",
                "type": "checkout.session.completed",
                "created": 1700000000,
                "livemode": false,
                "data": {"object": {"customer": "cus_1", "status": "complete", "subscription": "sub_1"}}
            }"#,
        )
        .unwrap();
        assert_eq!(event.type_, "checkout.session.completed");
        assert_eq!(event.data.object["subscription"], "sub_1");
    }
}
