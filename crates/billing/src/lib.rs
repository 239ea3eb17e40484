// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Catalog rows carry many columns
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Registry billing module
//!
//! Organization subscriptions to the paid tier, kept in sync with the
//! payment provider.
//!
//! ## Features
//!
//! - **Provider capability**: [`BillingApi`] with live, local and in-memory backends
//! - **Subscriptions**: local subscriptions, products and prices
//! - **Webhooks**: verified, deduplicated provider events applied to local state
//! - **Catalog sync**: push local products and prices to the provider
//! - **Invariants**: read-only consistency checks

pub mod catalog;
pub mod client;
pub mod error;
pub mod invariants;
pub mod mock;
pub mod models;
pub mod provider;
pub mod signature;
pub mod stripe_api;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use registry_shared::Organization;
use sqlx::PgPool;

// Catalog
pub use catalog::{CatalogSync, CatalogSyncSummary};

// Client
pub use client::{BillingBackend, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Models
pub use models::{
    OrganizationSubscription, Subscription, SubscriptionItem, SubscriptionPrice,
    SubscriptionPriceChanges, SubscriptionProduct, SubscriptionProductChanges,
};

// Provider
pub use mock::MockBillingApi;
pub use provider::{
    BillingApi, CheckoutSession, CheckoutSessionLineItem, PortalSession, ProviderCustomer,
    ProviderPrice, ProviderProduct, WebhookEvent, WebhookEventData,
};
pub use stripe_api::StripeBillingApi;

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use webhooks::{
    classify_event, WebhookAction, WebhookEventRecord, WebhookHandler, WebhookOutcome,
};

/// Build the provider backend selected by `config.backend`
pub fn create_billing_api(config: StripeConfig) -> Arc<dyn BillingApi> {
    match config.backend {
        BillingBackend::Stripe | BillingBackend::Local => {
            Arc::new(StripeBillingApi::new(StripeClient::new(config)))
        }
        BillingBackend::Mock => Arc::new(MockBillingApi::new(
            config.publishable_key,
            config.webhook_secret,
        )),
    }
}

/// Serializes pushing the default product and price to the provider
const DEFAULT_PRICE_SYNC_LOCK_KEY: i64 = 0x7375_6273_7379_6e63;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub backend: BillingBackend,
    pub api: Arc<dyn BillingApi>,
    /// In-process provider state, present only for the mock backend
    pub mock: Option<Arc<MockBillingApi>>,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub catalog: CatalogSync,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        match config.backend {
            BillingBackend::Mock => Self::with_mock(
                Arc::new(MockBillingApi::new(
                    config.publishable_key,
                    config.webhook_secret,
                )),
                pool,
            ),
            backend => Self::with_api(backend, create_billing_api(config), pool),
        }
    }

    /// Create a mock-backed billing service that keeps a handle on the mock
    pub fn with_mock(mock: Arc<MockBillingApi>, pool: PgPool) -> Self {
        let mut service = Self::with_api(BillingBackend::Mock, mock.clone(), pool);
        service.mock = Some(mock);
        service
    }

    /// Create a billing service around an existing provider backend
    pub fn with_api(backend: BillingBackend, api: Arc<dyn BillingApi>, pool: PgPool) -> Self {
        tracing::info!(backend = %backend, "Billing service initialized");

        let subscriptions = SubscriptionService::new(pool.clone());
        Self {
            backend,
            webhooks: WebhookHandler::new(api.clone(), pool.clone()),
            catalog: CatalogSync::new(api.clone(), subscriptions.clone()),
            invariants: InvariantChecker::new(pool),
            subscriptions,
            api,
            mock: None,
        }
    }

    pub fn is_mock(&self) -> bool {
        self.backend == BillingBackend::Mock
    }

    /// Default price, pushed to the provider first if it has no provider id yet
    ///
    /// The push runs under an advisory lock so concurrent checkouts share one
    /// provider price.
    pub async fn default_checkout_price(&self) -> BillingResult<SubscriptionPrice> {
        let price = self
            .subscriptions
            .get_or_create_default_subscription_price()
            .await?;
        if price.price_id.is_some() {
            return Ok(price);
        }

        // Held across the provider calls; released on commit or drop
        let mut lock = self.subscriptions.pool().begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(DEFAULT_PRICE_SYNC_LOCK_KEY)
            .execute(&mut *lock)
            .await?;

        let mut price = self
            .subscriptions
            .get_or_create_default_subscription_price()
            .await?;
        if price.price_id.is_some() {
            lock.commit().await?;
            return Ok(price);
        }

        let mut product = self
            .subscriptions
            .get_subscription_product(price.subscription_product_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "Subscription product {}",
                    price.subscription_product_id
                ))
            })?;

        if product.product_id.is_none() {
            self.api.sync_product(&mut product).await?;
            product = self
                .subscriptions
                .update_subscription_product(
                    product.id,
                    SubscriptionProductChanges {
                        product_id: Some(product.product_id.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.api.sync_price(&mut price, &product).await?;
        let price = self
            .subscriptions
            .update_subscription_price(
                price.id,
                SubscriptionPriceChanges {
                    price_id: Some(price.price_id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        lock.commit().await?;
        tracing::info!(price_id = ?price.price_id, "Default price pushed to provider");
        Ok(price)
    }

    /// Provider customer of an organization, created and attached on first use
    ///
    /// The organization row stays locked while the provider customer is
    /// created, so concurrent callers attach a single customer.
    pub async fn organization_customer(&self, organization: &Organization) -> BillingResult<String> {
        if let Some(customer_id) = &organization.customer_id {
            return Ok(customer_id.clone());
        }

        let mut tx = self.subscriptions.pool().begin().await?;
        if let Some(customer_id) = self
            .subscriptions
            .lock_organization_customer(&mut tx, organization.id)
            .await?
        {
            tx.commit().await?;
            return Ok(customer_id);
        }

        let customer = self
            .api
            .create_customer(&organization.name, &organization.display_name)
            .await?;
        self.subscriptions
            .set_organization_customer(&mut tx, organization.id, &customer.id)
            .await?;
        tx.commit().await?;

        Ok(customer.id)
    }
}
