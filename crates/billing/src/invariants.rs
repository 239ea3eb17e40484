//! Billing invariants
//!
//! Read-only consistency checks over the subscription tables. They can be run
//! after a webhook backlog has been processed, or on a schedule by the worker.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

const CHECKS: [&str; 5] = [
    "single_active_price",
    "subscription_linked_once",
    "subscription_customer_matches_organization",
    "subscription_has_items",
    "active_catalog_synced",
];

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Organization(s) affected
    pub org_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customers may be billed incorrectly
    Critical,
    High,
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ActivePriceRow {
    id: Uuid,
    price_id: Option<String>,
    unit_amount: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct LinkCountRow {
    subscription_id: String,
    customer_id: String,
    link_count: i64,
    org_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerMismatchRow {
    org_id: Uuid,
    org_customer_id: Option<String>,
    subscription_id: String,
    customer_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingItemsRow {
    org_id: Option<Uuid>,
    subscription_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UnsyncedRow {
    kind: String,
    id: Uuid,
    name: String,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = CHECKS.len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one active price
    ///
    /// New subscriptions are placed on "the" active price; with several the
    /// default price bootstrap refuses to pick one.
    async fn check_single_active_price(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ActivePriceRow> = sqlx::query_as(
            r#"
            SELECT id, price_id, unit_amount
            FROM subscription_prices
            WHERE is_active
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.len() <= 1 {
            return Ok(vec![]);
        }

        Ok(vec![InvariantViolation {
            invariant: "single_active_price".to_string(),
            org_ids: vec![],
            description: format!("{} active subscription prices (expected 1)", rows.len()),
            context: serde_json::json!({
                "prices": rows
                    .iter()
                    .map(|r| serde_json::json!({
                        "id": r.id,
                        "price_id": r.price_id,
                        "unit_amount": r.unit_amount,
                    }))
                    .collect::<Vec<_>>(),
            }),
            severity: ViolationSeverity::Critical,
        }])
    }

    /// Every subscription is linked to exactly one organization
    async fn check_subscription_linked_once(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<LinkCountRow> = sqlx::query_as(
            r#"
            SELECT
                s.subscription_id,
                s.customer_id,
                COUNT(os.id) AS link_count,
                COALESCE(
                    ARRAY_AGG(os.organization_id) FILTER (WHERE os.organization_id IS NOT NULL),
                    '{}'
                ) AS org_ids
            FROM subscriptions s
            LEFT JOIN organization_subscriptions os ON os.subscription_id = s.id
            GROUP BY s.id, s.subscription_id, s.customer_id
            HAVING COUNT(os.id) <> 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_linked_once".to_string(),
                description: format!(
                    "Subscription {} is linked to {} organizations (expected 1)",
                    row.subscription_id, row.link_count
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "customer_id": row.customer_id,
                    "link_count": row.link_count,
                }),
                org_ids: row.org_ids,
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A linked organization holds the subscription's customer
    async fn check_subscription_customer_matches_organization(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CustomerMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                o.id AS org_id,
                o.customer_id AS org_customer_id,
                s.subscription_id,
                s.customer_id
            FROM organization_subscriptions os
            JOIN organizations o ON o.id = os.organization_id
            JOIN subscriptions s ON s.id = os.subscription_id
            WHERE o.customer_id IS DISTINCT FROM s.customer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_customer_matches_organization".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Subscription {} belongs to customer {} but its organization has customer {}",
                    row.subscription_id,
                    row.customer_id,
                    row.org_customer_id.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "customer_id": row.customer_id,
                    "org_customer_id": row.org_customer_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Every subscription has at least one line item
    async fn check_subscription_has_items(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingItemsRow> = sqlx::query_as(
            r#"
            SELECT os.organization_id AS org_id, s.subscription_id
            FROM subscriptions s
            LEFT JOIN organization_subscriptions os ON os.subscription_id = s.id
            WHERE NOT EXISTS (
                SELECT 1 FROM subscription_items si WHERE si.subscription_id = s.id
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_has_items".to_string(),
                org_ids: row.org_id.into_iter().collect(),
                description: format!("Subscription {} has no items", row.subscription_id),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Active products and prices carry a provider id
    async fn check_active_catalog_synced(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnsyncedRow> = sqlx::query_as(
            r#"
            SELECT 'product' AS kind, id, product_name AS name
            FROM subscription_products
            WHERE is_active AND product_id IS NULL
            UNION ALL
            SELECT 'price' AS kind, sp.id, p.product_name || ' ' || sp.currency AS name
            FROM subscription_prices sp
            JOIN subscription_products p ON p.id = sp.subscription_product_id
            WHERE sp.is_active AND sp.price_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_catalog_synced".to_string(),
                org_ids: vec![],
                description: format!(
                    "Active {} '{}' has not been synced to the provider",
                    row.kind, row.name
                ),
                context: serde_json::json!({
                    "kind": row.kind,
                    "id": row.id,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_price" => self.check_single_active_price().await,
            "subscription_linked_once" => self.check_subscription_linked_once().await,
            "subscription_customer_matches_organization" => {
                self.check_subscription_customer_matches_organization().await
            }
            "subscription_has_items" => self.check_subscription_has_items().await,
            "active_catalog_synced" => self.check_active_catalog_synced().await,
            other => Err(BillingError::InvalidInput(format!(
                "Unknown invariant check '{}'",
                other
            ))),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::SubscriptionService;
    use registry_shared::SubscriptionPriceInterval;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_active_price"));
        assert!(checks.contains(&"subscription_linked_once"));
    }

    #[sqlx::test(migrations = "../../migrations")]
    #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
    async fn test_healthy_after_checkout(pool: PgPool) {
        sqlx::query(
            "INSERT INTO organizations (name, display_name, customer_id) VALUES ('acme', 'Acme', 'cus_1')",
        )
        .execute(&pool)
        .await
        .unwrap();
        let subscriptions = SubscriptionService::new(pool.clone());
        let price = subscriptions
            .get_or_create_default_subscription_price()
            .await
            .unwrap();
        subscriptions.add_subscription("cus_1", "sub_1").await.unwrap();

        let checker = InvariantChecker::new(pool);
        // Only the unsynced default catalog is reported
        let summary = checker.run_all_checks().await.unwrap();
        assert_eq!(summary.checks_failed, 1);
        assert!(summary
            .violations
            .iter()
            .all(|v| v.invariant == "active_catalog_synced"));

        subscriptions
            .add_subscription_price(
                Some("price_2"),
                "usd",
                price.subscription_product_id,
                9900,
                SubscriptionPriceInterval::Year,
                None,
            )
            .await
            .unwrap();
        let violations = checker.run_check("single_active_price").await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);

        assert!(checker.run_check("nonexistent").await.is_err());
    }
}
