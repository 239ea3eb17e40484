//! In-process billing backend
//!
//! Keeps provider objects in memory so development servers and tests can run
//! the full checkout / webhook flow without network access. Checkout and
//! portal sessions redirect straight back to the application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use registry_shared::SubscriptionPriceInterval;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    parse_search_query, BillingApi, CheckoutSession, CheckoutSessionLineItem, DeletedObject,
    PortalSession, ProviderCustomer, ProviderList, ProviderPrice, ProviderProduct,
    ProviderRecurring,
};

#[derive(Debug, Default)]
struct MockState {
    customers: HashMap<String, ProviderCustomer>,
    products: Vec<ProviderProduct>,
    prices: Vec<ProviderPrice>,
    checkout_sessions: HashMap<String, CheckoutSession>,
    /// subscription id -> customer id
    subscriptions: HashMap<String, String>,
}

/// Billing backend that never leaves the process
pub struct MockBillingApi {
    publishable_key: String,
    webhook_secret: String,
    sequence: AtomicU64,
    state: Mutex<MockState>,
}

impl MockBillingApi {
    pub fn new(publishable_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            publishable_key: publishable_key.into(),
            webhook_secret: webhook_secret.into(),
            sequence: AtomicU64::new(1),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Next object id with the given prefix; doubles as a monotonic `created` stamp
    fn next_id(&self, prefix: &str) -> (String, i64) {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        (format!("{}_mock{:08}", prefix, n), 1_600_000_000 + n as i64)
    }

    /// Record that `subscription_id` belongs to `customer_id`
    ///
    /// Used when a mock checkout completes so later lookups resolve. Customers
    /// created before this process started are registered on the way.
    pub async fn record_subscription(&self, subscription_id: &str, customer_id: &str) {
        let mut state = self.state.lock().await;
        state
            .customers
            .entry(customer_id.to_string())
            .or_insert_with(|| ProviderCustomer {
                id: customer_id.to_string(),
                name: None,
                description: None,
                email: None,
            });
        state
            .subscriptions
            .insert(subscription_id.to_string(), customer_id.to_string());
    }

    #[cfg(test)]
    pub(crate) async fn customer_count(&self) -> usize {
        self.state.lock().await.customers.len()
    }

    fn matches_clauses<F>(clauses: &[(String, String)], field: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        clauses
            .iter()
            .all(|(key, value)| field(key).is_some_and(|actual| actual == *value))
    }
}

fn page<T: Clone>(items: &[T], limit: u32) -> ProviderList<T> {
    let limit = limit.clamp(1, 100) as usize;
    ProviderList {
        data: items.iter().take(limit).cloned().collect(),
        has_more: items.len() > limit,
    }
}

#[async_trait]
impl BillingApi for MockBillingApi {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn publishable_key(&self) -> &str {
        &self.publishable_key
    }

    fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }

    async fn get_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let state = self.state.lock().await;
        state
            .checkout_sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Checkout session {}", session_id)))
    }

    async fn get_customer(&self, subscription_id: &str) -> BillingResult<ProviderCustomer> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(subscription_id)
            .and_then(|customer_id| state.customers.get(customer_id))
            .cloned()
            .ok_or_else(|| {
                BillingError::NotFound(format!("Customer for subscription {}", subscription_id))
            })
    }

    async fn create_customer(&self, name: &str, description: &str) -> BillingResult<ProviderCustomer> {
        let (id, _) = self.next_id("cus");
        let customer = ProviderCustomer {
            id: id.clone(),
            name: Some(name.to_string()),
            description: Some(description.to_string()),
            email: None,
        };

        self.state
            .lock()
            .await
            .customers
            .insert(id, customer.clone());
        Ok(customer)
    }

    async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        success_url: &str,
        _cancel_url: &str,
    ) -> BillingResult<CheckoutSession> {
        // Customers and prices are not checked: ids stored in the database
        // outlive the in-memory state across restarts
        tracing::debug!(customer_id = %customer_id, price_id = %price_id, "Mock checkout session");

        let (id, _) = self.next_id("cs");
        let (line_item_id, _) = self.next_id("li");
        let session = CheckoutSession {
            url: Some(format!("{}?session_id={}", success_url, id)),
            id: id.clone(),
            customer: Some(customer_id.to_string()),
            subscription: None,
            status: Some("open".to_string()),
            mode: Some("subscription".to_string()),
            line_items: Some(ProviderList {
                data: vec![CheckoutSessionLineItem {
                    id: line_item_id,
                    price: Some(price_id.to_string()),
                    quantity: Some(1),
                }],
                has_more: false,
            }),
        };
        self.state
            .lock()
            .await
            .checkout_sessions
            .insert(id, session.clone());
        Ok(session)
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<PortalSession> {
        let (id, _) = self.next_id("bps");
        Ok(PortalSession {
            id,
            url: return_url.to_string(),
            customer: Some(customer_id.to_string()),
            return_url: Some(return_url.to_string()),
        })
    }

    async fn create_product(
        &self,
        name: &str,
        description: &str,
        tax_code: Option<&str>,
    ) -> BillingResult<ProviderProduct> {
        let (id, created) = self.next_id("prod");
        let product = ProviderProduct {
            id,
            active: true,
            created,
            name: name.to_string(),
            description: Some(description.to_string()),
            tax_code: tax_code.map(str::to_string),
        };

        self.state.lock().await.products.push(product.clone());
        Ok(product)
    }

    async fn retrieve_product(&self, product_id: &str) -> BillingResult<ProviderProduct> {
        let state = self.state.lock().await;
        state
            .products
            .iter()
            .find(|p| p.id == product_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Product {}", product_id)))
    }

    async fn update_product(
        &self,
        product_id: &str,
        name: &str,
        description: &str,
        tax_code: Option<&str>,
    ) -> BillingResult<ProviderProduct> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .iter_mut()
            .find(|p| p.id == product_id)
            .ok_or_else(|| BillingError::NotFound(format!("Product {}", product_id)))?;

        product.name = name.to_string();
        product.description = Some(description.to_string());
        product.tax_code = tax_code.map(str::to_string);
        Ok(product.clone())
    }

    async fn list_all_products(&self, limit: u32) -> BillingResult<ProviderList<ProviderProduct>> {
        let state = self.state.lock().await;
        Ok(page(&state.products, limit))
    }

    async fn delete_product(&self, product_id: &str) -> BillingResult<DeletedObject> {
        let mut state = self.state.lock().await;
        let before = state.products.len();
        state.products.retain(|p| p.id != product_id);

        if state.products.len() == before {
            return Err(BillingError::NotFound(format!("Product {}", product_id)));
        }

        Ok(DeletedObject {
            id: product_id.to_string(),
            deleted: true,
        })
    }

    async fn search_products(
        &self,
        query: &str,
        limit: u32,
    ) -> BillingResult<ProviderList<ProviderProduct>> {
        let clauses = parse_search_query(query);
        let state = self.state.lock().await;
        let found: Vec<ProviderProduct> = state
            .products
            .iter()
            .filter(|p| {
                Self::matches_clauses(&clauses, |field| match field {
                    "active" => Some(p.active.to_string()),
                    "name" => Some(p.name.clone()),
                    "description" => p.description.clone(),
                    _ => None,
                })
            })
            .cloned()
            .collect();
        Ok(page(&found, limit))
    }

    async fn create_price(
        &self,
        unit_amount: i64,
        currency: &str,
        recurring: SubscriptionPriceInterval,
        product_id: &str,
        tax_behavior: Option<&str>,
    ) -> BillingResult<ProviderPrice> {
        let mut state = self.state.lock().await;
        if !state.products.iter().any(|p| p.id == product_id) {
            return Err(BillingError::NotFound(format!("Product {}", product_id)));
        }

        let (id, created) = self.next_id("price");
        let price = ProviderPrice {
            id,
            active: true,
            created,
            currency: currency.to_string(),
            unit_amount: Some(unit_amount),
            product: product_id.to_string(),
            recurring: Some(ProviderRecurring {
                interval: recurring.as_str().to_string(),
            }),
            tax_behavior: tax_behavior.map(str::to_string),
        };
        state.prices.push(price.clone());
        Ok(price)
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<ProviderPrice> {
        let state = self.state.lock().await;
        state
            .prices
            .iter()
            .find(|p| p.id == price_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Price {}", price_id)))
    }

    async fn update_price(&self, price_id: &str, active: bool) -> BillingResult<ProviderPrice> {
        let mut state = self.state.lock().await;
        let price = state
            .prices
            .iter_mut()
            .find(|p| p.id == price_id)
            .ok_or_else(|| BillingError::NotFound(format!("Price {}", price_id)))?;

        price.active = active;
        Ok(price.clone())
    }

    async fn list_all_prices(&self, limit: u32) -> BillingResult<ProviderList<ProviderPrice>> {
        let state = self.state.lock().await;
        Ok(page(&state.prices, limit))
    }

    async fn search_prices(
        &self,
        query: &str,
        limit: u32,
    ) -> BillingResult<ProviderList<ProviderPrice>> {
        let clauses = parse_search_query(query);
        let state = self.state.lock().await;
        let found: Vec<ProviderPrice> = state
            .prices
            .iter()
            .filter(|p| {
                Self::matches_clauses(&clauses, |field| match field {
                    "active" => Some(p.active.to_string()),
                    "product" => Some(p.product.clone()),
                    "currency" => Some(p.currency.clone()),
                    _ => None,
                })
            })
            .cloned()
            .collect();
        Ok(page(&found, limit))
    }
}
