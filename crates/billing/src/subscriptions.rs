//! Subscription management
//!
//! Local records of subscriptions, products and prices. The provider is the
//! source of truth for payment state; these tables hold what the application
//! needs to decide access and to render billing pages, and are kept current
//! by the webhook handler.

use registry_shared::{Organization, SubscriptionPriceInterval, SubscriptionStatus};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    OrganizationSubscription, Subscription, SubscriptionItem, SubscriptionPrice,
    SubscriptionPriceChanges, SubscriptionProduct, SubscriptionProductChanges,
    DEFAULT_CURRENCY, DEFAULT_PRODUCT_DESCRIPTION, DEFAULT_PRODUCT_NAME, DEFAULT_TAX_BEHAVIOR,
    DEFAULT_TAX_CODE, DEFAULT_UNIT_AMOUNT_CENTS,
};

/// Advisory lock key serializing the default price bootstrap
const DEFAULT_PRICE_LOCK_KEY: i64 = 0x7375_6273_7072_6963;

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ============ Subscriptions ============

    pub async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, customer_id, subscription_id, subscription_price_id, status
            FROM subscriptions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Local id of the subscription with this provider subscription id
    pub async fn find_subscriptionid(&self, subscription_id: &str) -> BillingResult<Option<Uuid>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM subscriptions WHERE subscription_id = $1 LIMIT 2")
                .bind(subscription_id)
                .fetch_all(&self.pool)
                .await?;

        single_match(ids, || format!("subscription_id {}", subscription_id))
    }

    /// Record a new subscription for the organization holding `customer_id`
    ///
    /// The subscription starts out active, on the default price, linked to
    /// the organization and with a single line item.
    pub async fn add_subscription(
        &self,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let price = self.get_or_create_default_subscription_price().await?;

        let mut tx = self.pool.begin().await?;

        let organization_id: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM organizations WHERE customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&mut *tx)
                .await?;
        let organization_id = organization_id.ok_or_else(|| {
            BillingError::NotFound(format!("Organization with customer {}", customer_id))
        })?;

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (customer_id, subscription_id, subscription_price_id, status)
            VALUES ($1, $2, $3, $4)
            RETURNING id, customer_id, subscription_id, subscription_price_id, status
            "#,
        )
        .bind(customer_id)
        .bind(subscription_id)
        .bind(price.id)
        .bind(SubscriptionStatus::Active)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO organization_subscriptions (organization_id, subscription_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(organization_id)
        .bind(subscription.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO subscription_items (subscription_id, subscription_price_id, quantity)
            VALUES ($1, $2, 1)
            "#,
        )
        .bind(subscription.id)
        .bind(price.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            org_id = %organization_id,
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            "Added subscription"
        );

        Ok(subscription)
    }

    pub async fn update_subscription_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        let result = sqlx::query("UPDATE subscriptions SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Subscription {}", id)));
        }

        tracing::info!(id = %id, status = %status, "Updated subscription status");
        Ok(())
    }

    /// Delete a subscription and its organization link; items cascade
    pub async fn delete_subscription(&self, id: Uuid) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM organization_subscriptions WHERE subscription_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Subscription {}", id)));
        }

        tx.commit().await?;

        tracing::info!(id = %id, "Deleted subscription");
        Ok(())
    }

    pub async fn get_subscriptions_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, customer_id, subscription_id, subscription_price_id, status
            FROM subscriptions
            WHERE customer_id = $1
            ORDER BY subscription_id
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// Subscriptions linked to an organization
    pub async fn get_subscriptions_by_organization(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT s.id, s.customer_id, s.subscription_id, s.subscription_price_id, s.status
            FROM subscriptions s
            JOIN organization_subscriptions os ON os.subscription_id = s.id
            WHERE os.organization_id = $1
            ORDER BY s.subscription_id
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    pub async fn get_organization_subscriptions(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<OrganizationSubscription>> {
        let links = sqlx::query_as::<_, OrganizationSubscription>(
            r#"
            SELECT id, organization_id, subscription_id
            FROM organization_subscriptions
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(links)
    }

    pub async fn get_subscription_items(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionItem>> {
        let items = sqlx::query_as::<_, SubscriptionItem>(
            r#"
            SELECT id, subscription_item_id, subscription_id, subscription_price_id, quantity
            FROM subscription_items
            WHERE subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// Delete every subscription of a customer and detach it from its organization
    ///
    /// Returns the number of subscriptions removed.
    pub async fn delete_customer(&self, customer_id: &str) -> BillingResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM organization_subscriptions
            WHERE subscription_id IN (SELECT id FROM subscriptions WHERE customer_id = $1)
            "#,
        )
        .bind(customer_id)
        .execute(&mut *tx)
        .await?;

        // Must run before the organization update: the FK cascades customer_id updates
        let deleted = sqlx::query("DELETE FROM subscriptions WHERE customer_id = $1")
            .bind(customer_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("UPDATE organizations SET customer_id = NULL WHERE customer_id = $1")
            .bind(customer_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!(
            customer_id = %customer_id,
            subscriptions_deleted = deleted,
            "Deleted customer billing data"
        );

        Ok(deleted)
    }

    // ============ Organizations ============

    pub async fn get_organization(&self, id: Uuid) -> BillingResult<Option<Organization>> {
        let organization = sqlx::query_as::<_, Organization>(
            r#"
            SELECT id, name, display_name, orgtype, is_active, is_approved,
                   date_approved, customer_id, created
            FROM organizations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(organization)
    }

    pub async fn get_organization_by_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<Organization>> {
        let organization = sqlx::query_as::<_, Organization>(
            r#"
            SELECT id, name, display_name, orgtype, is_active, is_approved,
                   date_approved, customer_id, created
            FROM organizations
            WHERE customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(organization)
    }

    /// Lock an organization row for the rest of the transaction and return
    /// its current provider customer
    pub async fn lock_organization_customer(
        &self,
        conn: &mut PgConnection,
        organization_id: Uuid,
    ) -> BillingResult<Option<String>> {
        let customer_id: Option<Option<String>> =
            sqlx::query_scalar("SELECT customer_id FROM organizations WHERE id = $1 FOR UPDATE")
                .bind(organization_id)
                .fetch_optional(conn)
                .await?;

        customer_id
            .ok_or_else(|| BillingError::NotFound(format!("Organization {}", organization_id)))
    }

    /// Attach a provider customer to an organization
    pub async fn set_organization_customer(
        &self,
        conn: &mut PgConnection,
        organization_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query("UPDATE organizations SET customer_id = $1 WHERE id = $2")
            .bind(customer_id)
            .bind(organization_id)
            .execute(conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Organization {}",
                organization_id
            )));
        }

        tracing::info!(
            org_id = %organization_id,
            customer_id = %customer_id,
            "Attached billing customer to organization"
        );
        Ok(())
    }

    // ============ Products ============

    pub async fn get_subscription_product(
        &self,
        id: Uuid,
    ) -> BillingResult<Option<SubscriptionProduct>> {
        let product = sqlx::query_as::<_, SubscriptionProduct>(
            r#"
            SELECT id, product_id, product_name, description, is_active, tax_code
            FROM subscription_products
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    /// All products ordered by name
    pub async fn get_subscription_products(&self) -> BillingResult<Vec<SubscriptionProduct>> {
        let products = sqlx::query_as::<_, SubscriptionProduct>(
            r#"
            SELECT id, product_id, product_name, description, is_active, tax_code
            FROM subscription_products
            ORDER BY product_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(products)
    }

    /// Local id of the product matching a product name or provider product id
    pub async fn find_subscription_productid(
        &self,
        search_term: &str,
    ) -> BillingResult<Option<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM subscription_products
            WHERE product_name = $1 OR product_id = $1
            LIMIT 2
            "#,
        )
        .bind(search_term)
        .fetch_all(&self.pool)
        .await?;

        single_match(ids, || format!("product {}", search_term))
    }

    pub async fn add_subscription_product(
        &self,
        product_name: &str,
        description: &str,
        product_id: Option<&str>,
        tax_code: Option<&str>,
    ) -> BillingResult<SubscriptionProduct> {
        let mut conn = self.pool.acquire().await?;
        insert_product(&mut conn, product_name, description, product_id, tax_code).await
    }

    /// Apply a partial update; fields are stored as given
    pub async fn update_subscription_product(
        &self,
        id: Uuid,
        changes: SubscriptionProductChanges,
    ) -> BillingResult<SubscriptionProduct> {
        let mut product = self
            .get_subscription_product(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription product {}", id)))?;
        changes.apply(&mut product);

        let product = sqlx::query_as::<_, SubscriptionProduct>(
            r#"
            UPDATE subscription_products
            SET product_id = $2, product_name = $3, description = $4,
                is_active = $5, tax_code = $6
            WHERE id = $1
            RETURNING id, product_id, product_name, description, is_active, tax_code
            "#,
        )
        .bind(product.id)
        .bind(&product.product_id)
        .bind(&product.product_name)
        .bind(&product.description)
        .bind(product.is_active)
        .bind(&product.tax_code)
        .fetch_one(&self.pool)
        .await?;

        Ok(product)
    }

    /// Delete a product; its prices cascade
    pub async fn delete_subscription_product(&self, id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("DELETE FROM subscription_products WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Subscription product {}", id)));
        }
        Ok(())
    }

    // ============ Prices ============

    /// The single active price, created along with its product on first use
    ///
    /// Concurrent callers are serialized with a transaction-scoped advisory
    /// lock so only one default price is ever created.
    pub async fn get_or_create_default_subscription_price(
        &self,
    ) -> BillingResult<SubscriptionPrice> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(DEFAULT_PRICE_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let mut active = sqlx::query_as::<_, SubscriptionPrice>(
            r#"
            SELECT id, price_id, currency, subscription_product_id, unit_amount,
                   is_active, recurring, tax_behavior
            FROM subscription_prices
            WHERE is_active
            LIMIT 2
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        if active.len() > 1 {
            return Err(BillingError::Internal(
                "More than one active subscription price".to_string(),
            ));
        }

        let price = match active.pop() {
            Some(price) => price,
            None => {
                let product = insert_product(
                    &mut tx,
                    DEFAULT_PRODUCT_NAME,
                    DEFAULT_PRODUCT_DESCRIPTION,
                    None,
                    Some(DEFAULT_TAX_CODE),
                )
                .await?;

                let price = insert_price(
                    &mut tx,
                    None,
                    DEFAULT_CURRENCY,
                    product.id,
                    DEFAULT_UNIT_AMOUNT_CENTS,
                    SubscriptionPriceInterval::Month,
                    Some(DEFAULT_TAX_BEHAVIOR),
                )
                .await?;

                tracing::info!(
                    product_id = %product.id,
                    price_id = %price.id,
                    "Created default subscription price"
                );
                price
            }
        };

        tx.commit().await?;
        Ok(price)
    }

    pub async fn get_subscription_price(
        &self,
        id: Uuid,
    ) -> BillingResult<Option<SubscriptionPrice>> {
        let price = sqlx::query_as::<_, SubscriptionPrice>(
            r#"
            SELECT id, price_id, currency, subscription_product_id, unit_amount,
                   is_active, recurring, tax_behavior
            FROM subscription_prices
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(price)
    }

    /// All prices ordered by id
    pub async fn get_subscription_prices(&self) -> BillingResult<Vec<SubscriptionPrice>> {
        let prices = sqlx::query_as::<_, SubscriptionPrice>(
            r#"
            SELECT id, price_id, currency, subscription_product_id, unit_amount,
                   is_active, recurring, tax_behavior
            FROM subscription_prices
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(prices)
    }

    /// Local id of the price with this provider price id
    pub async fn find_subscription_priceid(&self, price_id: &str) -> BillingResult<Option<Uuid>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM subscription_prices WHERE price_id = $1 LIMIT 2")
                .bind(price_id)
                .fetch_all(&self.pool)
                .await?;

        single_match(ids, || format!("price {}", price_id))
    }

    pub async fn add_subscription_price(
        &self,
        price_id: Option<&str>,
        currency: &str,
        subscription_product_id: Uuid,
        unit_amount: i32,
        recurring: SubscriptionPriceInterval,
        tax_behavior: Option<&str>,
    ) -> BillingResult<SubscriptionPrice> {
        let mut conn = self.pool.acquire().await?;
        insert_price(
            &mut conn,
            price_id,
            currency,
            subscription_product_id,
            unit_amount,
            recurring,
            tax_behavior,
        )
        .await
    }

    /// Apply a partial update; fields are stored as given
    pub async fn update_subscription_price(
        &self,
        id: Uuid,
        changes: SubscriptionPriceChanges,
    ) -> BillingResult<SubscriptionPrice> {
        let mut price = self
            .get_subscription_price(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription price {}", id)))?;
        changes.apply(&mut price);

        let price = sqlx::query_as::<_, SubscriptionPrice>(
            r#"
            UPDATE subscription_prices
            SET price_id = $2, currency = $3, subscription_product_id = $4,
                unit_amount = $5, is_active = $6, recurring = $7, tax_behavior = $8
            WHERE id = $1
            RETURNING id, price_id, currency, subscription_product_id, unit_amount,
                      is_active, recurring, tax_behavior
            "#,
        )
        .bind(price.id)
        .bind(&price.price_id)
        .bind(&price.currency)
        .bind(price.subscription_product_id)
        .bind(price.unit_amount)
        .bind(price.is_active)
        .bind(price.recurring)
        .bind(&price.tax_behavior)
        .fetch_one(&self.pool)
        .await?;

        Ok(price)
    }

    pub async fn delete_subscription_price(&self, id: Uuid) -> BillingResult<()> {
        let result = sqlx::query("DELETE FROM subscription_prices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Subscription price {}", id)));
        }
        Ok(())
    }
}

/// `None` for no rows, the id for one row, an error when ambiguous
fn single_match<F>(ids: Vec<Uuid>, describe: F) -> BillingResult<Option<Uuid>>
where
    F: FnOnce() -> String,
{
    match ids.as_slice() {
        [] => Ok(None),
        [id] => Ok(Some(*id)),
        _ => Err(BillingError::InvalidInput(format!(
            "More than one row matches {}",
            describe()
        ))),
    }
}

async fn insert_product(
    conn: &mut PgConnection,
    product_name: &str,
    description: &str,
    product_id: Option<&str>,
    tax_code: Option<&str>,
) -> BillingResult<SubscriptionProduct> {
    let product = sqlx::query_as::<_, SubscriptionProduct>(
        r#"
        INSERT INTO subscription_products (product_name, description, product_id, tax_code)
        VALUES ($1, $2, $3, $4)
        RETURNING id, product_id, product_name, description, is_active, tax_code
        "#,
    )
    .bind(product_name)
    .bind(description)
    .bind(product_id)
    .bind(tax_code)
    .fetch_one(&mut *conn)
    .await?;

    Ok(product)
}

async fn insert_price(
    conn: &mut PgConnection,
    price_id: Option<&str>,
    currency: &str,
    subscription_product_id: Uuid,
    unit_amount: i32,
    recurring: SubscriptionPriceInterval,
    tax_behavior: Option<&str>,
) -> BillingResult<SubscriptionPrice> {
    let price = sqlx::query_as::<_, SubscriptionPrice>(
        r#"
        INSERT INTO subscription_prices
            (price_id, currency, subscription_product_id, unit_amount, recurring, tax_behavior)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, price_id, currency, subscription_product_id, unit_amount,
                  is_active, recurring, tax_behavior
        "#,
    )
    .bind(price_id)
    .bind(currency)
    .bind(subscription_product_id)
    .bind(unit_amount)
    .bind(recurring)
    .bind(tax_behavior)
    .fetch_one(&mut *conn)
    .await?;

    Ok(price)
}
