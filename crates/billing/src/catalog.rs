//! Catalog sync
//!
//! Pushes local products and prices to the provider and stores the provider
//! ids on the local rows.

use std::sync::Arc;

use serde::Serialize;

use crate::error::BillingResult;
use crate::models::{SubscriptionPriceChanges, SubscriptionProductChanges};
use crate::provider::BillingApi;
use crate::subscriptions::SubscriptionService;

/// Counts from one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogSyncSummary {
    pub products_synced: usize,
    pub prices_synced: usize,
    pub prices_skipped: usize,
}

#[derive(Clone)]
pub struct CatalogSync {
    api: Arc<dyn BillingApi>,
    subscriptions: SubscriptionService,
}

impl CatalogSync {
    pub fn new(api: Arc<dyn BillingApi>, subscriptions: SubscriptionService) -> Self {
        Self { api, subscriptions }
    }

    /// Sync every active product and its active prices
    ///
    /// Prices that already carry a provider id are left alone unless `force`
    /// is set, since re-syncing a price replaces it at the provider.
    pub async fn sync_all(&self, force: bool) -> BillingResult<CatalogSyncSummary> {
        let mut summary = CatalogSyncSummary::default();
        let prices = self.subscriptions.get_subscription_prices().await?;

        for mut product in self.subscriptions.get_subscription_products().await? {
            if !product.is_active {
                continue;
            }

            self.api.sync_product(&mut product).await?;
            self.subscriptions
                .update_subscription_product(
                    product.id,
                    SubscriptionProductChanges {
                        product_id: Some(product.product_id.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            summary.products_synced += 1;

            for mut price in prices
                .iter()
                .filter(|p| p.subscription_product_id == product.id && p.is_active)
                .cloned()
            {
                if price.price_id.is_some() && !force {
                    summary.prices_skipped += 1;
                    continue;
                }

                self.api.sync_price(&mut price, &product).await?;
                self.subscriptions
                    .update_subscription_price(
                        price.id,
                        SubscriptionPriceChanges {
                            price_id: Some(price.price_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                summary.prices_synced += 1;
            }
        }

        tracing::info!(
            backend = self.api.name(),
            products_synced = summary.products_synced,
            prices_synced = summary.prices_synced,
            prices_skipped = summary.prices_skipped,
            "Catalog sync finished"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBillingApi;
    use crate::provider::DEFAULT_LIST_LIMIT;
    use sqlx::PgPool;

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
    async fn test_sync_all_records_provider_ids(pool: PgPool) {
        let api = Arc::new(MockBillingApi::new("pk", "whsec"));
        let subscriptions = SubscriptionService::new(pool);
        let default_price = subscriptions
            .get_or_create_default_subscription_price()
            .await
            .unwrap();

        let sync = CatalogSync::new(api.clone(), subscriptions.clone());
        let summary = sync.sync_all(false).await.unwrap();
        assert_eq!(summary.products_synced, 1);
        assert_eq!(summary.prices_synced, 1);

        let price = subscriptions
            .get_subscription_price(default_price.id)
            .await
            .unwrap()
            .unwrap();
        let provider_price = api
            .retrieve_price(price.price_id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(provider_price.active);

        // Second run keeps the existing provider price
        let summary = sync.sync_all(false).await.unwrap();
        assert_eq!(summary.prices_skipped, 1);
        assert_eq!(api.list_all_prices(DEFAULT_LIST_LIMIT).await.unwrap().data.len(), 1);
        assert_eq!(api.list_all_products(DEFAULT_LIST_LIMIT).await.unwrap().data.len(), 1);

        // Forcing replaces it
        sync.sync_all(true).await.unwrap();
        let prices = api.list_all_prices(DEFAULT_LIST_LIMIT).await.unwrap().data;
        assert_eq!(prices.len(), 2);
        assert_eq!(prices.iter().filter(|p| p.active).count(), 1);
    }
}
