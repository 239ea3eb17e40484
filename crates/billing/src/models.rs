//! Subscription catalog and subscription rows

use registry_shared::{SubscriptionPriceInterval, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Name of the product created when no default price exists yet
pub const DEFAULT_PRODUCT_NAME: &str = "PyPI";
pub const DEFAULT_PRODUCT_DESCRIPTION: &str = "Organization account for companies";
/// "Software as a service (SaaS) - business use"
pub const DEFAULT_TAX_CODE: &str = "txcd_10103001";
pub const DEFAULT_CURRENCY: &str = "usd";
pub const DEFAULT_UNIT_AMOUNT_CENTS: i32 = 5000;
pub const DEFAULT_TAX_BEHAVIOR: &str = "inclusive";

/// A subscription held by a provider customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: String,
    /// Provider subscription id
    pub subscription_id: String,
    pub subscription_price_id: Uuid,
    pub status: SubscriptionStatus,
}

impl Subscription {
    pub fn is_restricted(&self) -> bool {
        self.status.is_restricted()
    }
}

/// Link between an organization and one of its subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct OrganizationSubscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionProduct {
    pub id: Uuid,
    /// Provider product id, set once the product has been synced
    pub product_id: Option<String>,
    pub product_name: String,
    pub description: String,
    pub is_active: bool,
    /// See https://stripe.com/docs/tax/tax-categories
    pub tax_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionPrice {
    pub id: Uuid,
    /// Provider price id, set once the price has been synced
    pub price_id: Option<String>,
    pub currency: String,
    pub subscription_product_id: Uuid,
    /// Positive integer in cents
    pub unit_amount: i32,
    pub is_active: bool,
    pub recurring: SubscriptionPriceInterval,
    /// inclusive, exclusive or unspecified
    pub tax_behavior: Option<String>,
}

/// Line item of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionItem {
    pub id: Uuid,
    pub subscription_item_id: Option<String>,
    pub subscription_id: Uuid,
    pub subscription_price_id: Uuid,
    pub quantity: i32,
}

/// Partial update of a product; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionProductChanges {
    pub product_id: Option<Option<String>>,
    pub product_name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub tax_code: Option<Option<String>>,
}

impl SubscriptionProductChanges {
    pub fn apply(self, product: &mut SubscriptionProduct) {
        if let Some(product_id) = self.product_id {
            product.product_id = product_id;
        }
        if let Some(product_name) = self.product_name {
            product.product_name = product_name;
        }
        if let Some(description) = self.description {
            product.description = description;
        }
        if let Some(is_active) = self.is_active {
            product.is_active = is_active;
        }
        if let Some(tax_code) = self.tax_code {
            product.tax_code = tax_code;
        }
    }
}

/// Partial update of a price; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionPriceChanges {
    pub price_id: Option<Option<String>>,
    pub currency: Option<String>,
    pub subscription_product_id: Option<Uuid>,
    pub unit_amount: Option<i32>,
    pub is_active: Option<bool>,
    pub recurring: Option<SubscriptionPriceInterval>,
    pub tax_behavior: Option<Option<String>>,
}

impl SubscriptionPriceChanges {
    pub fn apply(self, price: &mut SubscriptionPrice) {
        if let Some(price_id) = self.price_id {
            price.price_id = price_id;
        }
        if let Some(currency) = self.currency {
            price.currency = currency;
        }
        if let Some(subscription_product_id) = self.subscription_product_id {
            price.subscription_product_id = subscription_product_id;
        }
        if let Some(unit_amount) = self.unit_amount {
            price.unit_amount = unit_amount;
        }
        if let Some(is_active) = self.is_active {
            price.is_active = is_active;
        }
        if let Some(recurring) = self.recurring {
            price.recurring = recurring;
        }
        if let Some(tax_behavior) = self.tax_behavior {
            price.tax_behavior = tax_behavior;
        }
    }
}
