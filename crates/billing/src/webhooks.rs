//! Provider webhook handling
//!
//! Events are verified, claimed in the `billing_webhook_events` ledger so a
//! redelivered event is applied at most once, classified into a
//! [`WebhookAction`] and applied through the [`SubscriptionService`].

use std::sync::Arc;

use registry_shared::SubscriptionStatus;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{BillingApi, WebhookEvent};
use crate::subscriptions::SubscriptionService;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CUSTOMER_SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const CUSTOMER_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const CUSTOMER_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const CUSTOMER_DELETED: &str = "customer.deleted";

/// Claims older than this are considered abandoned and may be taken over
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// What an event asks the application to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    /// Checkout finished: activate a known subscription or record a new one
    CompleteCheckout {
        customer_id: String,
        subscription_id: String,
    },
    /// Provider reports a new status for a subscription
    UpdateStatus {
        subscription_id: String,
        status: SubscriptionStatus,
    },
    /// Subscription was deleted at the provider
    CancelSubscription { subscription_id: String },
    /// Customer was deleted at the provider
    DeleteCustomer { customer_id: String },
    /// Event type we do not act on
    Ignore { event_type: String },
}

/// Result of handing an event to [`WebhookHandler::handle_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied(WebhookAction),
    /// Already processed (or in flight) under the same event id
    Duplicate,
}

fn required_str<'a>(object: &'a Value, field: &str, event_type: &str) -> BillingResult<&'a str> {
    object
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            BillingError::WebhookEventNotSupported(format!(
                "{} event is missing '{}'",
                event_type, field
            ))
        })
}

fn required_status(object: &Value, event_type: &str) -> BillingResult<SubscriptionStatus> {
    let status = required_str(object, "status", event_type)?;
    status.parse().map_err(|_| {
        BillingError::WebhookEventNotSupported(format!(
            "{} event has unknown subscription status '{}'",
            event_type, status
        ))
    })
}

/// Map an event to the action it requires
///
/// Known event types with missing or inconsistent fields are rejected.
pub fn classify_event(event: &WebhookEvent) -> BillingResult<WebhookAction> {
    let object = &event.data.object;
    let event_type = event.type_.as_str();

    match event_type {
        CHECKOUT_SESSION_COMPLETED => {
            let status = required_str(object, "status", event_type)?;
            if status != "complete" {
                return Err(BillingError::WebhookEventNotSupported(format!(
                    "Checkout session status '{}' is not complete",
                    status
                )));
            }

            Ok(WebhookAction::CompleteCheckout {
                customer_id: required_str(object, "customer", event_type)?.to_string(),
                subscription_id: required_str(object, "subscription", event_type)?.to_string(),
            })
        }
        CUSTOMER_SUBSCRIPTION_CREATED | CUSTOMER_SUBSCRIPTION_UPDATED => {
            let status = required_status(object, event_type)?;
            Ok(WebhookAction::UpdateStatus {
                subscription_id: required_str(object, "id", event_type)?.to_string(),
                status,
            })
        }
        CUSTOMER_SUBSCRIPTION_DELETED => {
            let status = required_status(object, event_type)?;
            if status != SubscriptionStatus::Canceled {
                return Err(BillingError::WebhookEventNotSupported(format!(
                    "Deleted subscription has status '{}'",
                    status
                )));
            }

            Ok(WebhookAction::CancelSubscription {
                subscription_id: required_str(object, "id", event_type)?.to_string(),
            })
        }
        CUSTOMER_DELETED => Ok(WebhookAction::DeleteCustomer {
            customer_id: required_str(object, "id", event_type)?.to_string(),
        }),
        other => Ok(WebhookAction::Ignore {
            event_type: other.to_string(),
        }),
    }
}

/// Webhook handler for provider events
#[derive(Clone)]
pub struct WebhookHandler {
    api: Arc<dyn BillingApi>,
    subscriptions: SubscriptionService,
    pool: PgPool,
}

impl WebhookHandler {
    pub fn new(api: Arc<dyn BillingApi>, pool: PgPool) -> Self {
        Self {
            api,
            subscriptions: SubscriptionService::new(pool.clone()),
            pool,
        }
    }

    /// Verify a delivery's signature and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.api.webhook_received(payload, signature).map_err(|e| {
            tracing::warn!(
                backend = self.api.name(),
                payload_len = payload.len(),
                error = %e,
                "Rejected webhook delivery"
            );
            e
        })
    }

    /// Handle a verified event
    ///
    /// The event id is claimed with `INSERT ... ON CONFLICT ... RETURNING`, so
    /// only one delivery of an event is applied. Events whose earlier attempt
    /// ended in an error can be claimed again, as can events left in
    /// `processing` for longer than [`PROCESSING_TIMEOUT_MINUTES`].
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let claimed: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO billing_webhook_events
                (event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE billing_webhook_events.processing_result = 'error'
               OR (billing_webhook_events.processing_result = 'processing'
                   AND billing_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $3))
            RETURNING id
            "#,
        )
        .bind(&event.id)
        .bind(&event.type_)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.type_,
                "Duplicate webhook event"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.type_,
            "Processing webhook event"
        );

        let result = match classify_event(event) {
            Ok(action) => self.apply(&action).await.map(|()| action),
            Err(e) => Err(e),
        };

        let (processing_result, error_message) = match &result {
            Ok(_) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        // A row left in 'processing' swallows redeliveries until the timeout
        if let Err(e) = self
            .record_result(&event.id, processing_result, error_message.as_deref())
            .await
        {
            tracing::warn!(
                event_id = %event.id,
                error = %e,
                "First attempt to record webhook result failed, retrying"
            );

            if let Err(retry_err) = self
                .record_result(&event.id, processing_result, error_message.as_deref())
                .await
            {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    processing_result = %processing_result,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record webhook processing result"
                );
                return Err(BillingError::Database(retry_err.to_string()));
            }
        }

        result.map(WebhookOutcome::Applied)
    }

    async fn record_result(
        &self,
        event_id: &str,
        processing_result: &str,
        error_message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply(&self, action: &WebhookAction) -> BillingResult<()> {
        match action {
            WebhookAction::CompleteCheckout {
                customer_id,
                subscription_id,
            } => match self.subscriptions.find_subscriptionid(subscription_id).await? {
                Some(id) => {
                    self.subscriptions
                        .update_subscription_status(id, SubscriptionStatus::Active)
                        .await
                }
                None => self
                    .subscriptions
                    .add_subscription(customer_id, subscription_id)
                    .await
                    .map(|_| ()),
            },
            WebhookAction::UpdateStatus {
                subscription_id,
                status,
            } => match self.subscriptions.find_subscriptionid(subscription_id).await? {
                Some(id) => {
                    self.subscriptions
                        .update_subscription_status(id, *status)
                        .await
                }
                None => {
                    tracing::info!(
                        subscription_id = %subscription_id,
                        "Status update for unknown subscription"
                    );
                    Ok(())
                }
            },
            WebhookAction::CancelSubscription { subscription_id } => {
                match self.subscriptions.find_subscriptionid(subscription_id).await? {
                    Some(id) => {
                        self.subscriptions
                            .update_subscription_status(id, SubscriptionStatus::Canceled)
                            .await
                    }
                    None => {
                        tracing::info!(
                            subscription_id = %subscription_id,
                            "Deletion of unknown subscription"
                        );
                        Ok(())
                    }
                }
            }
            WebhookAction::DeleteCustomer { customer_id } => self
                .subscriptions
                .delete_customer(customer_id)
                .await
                .map(|_| ()),
            WebhookAction::Ignore { event_type } => {
                tracing::debug!(event_type = %event_type, "Ignoring webhook event");
                Ok(())
            }
        }
    }

    /// Ledger entries, newest first, optionally filtered by result
    pub async fn list_webhooks(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT id, event_id, event_type, processing_result, error_message, created_at
            FROM billing_webhook_events
            WHERE $1::TEXT IS NULL OR processing_result = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status_filter)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

/// Stored webhook event record
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::WebhookEventData;
    use serde_json::json;

    fn event(type_: &str, object: Value) -> WebhookEvent {
        WebhookEvent {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            type_: type_.to_string(),
            created: 1_700_000_000,
            data: WebhookEventData { object },
        }
    }

    #[test]
    fn test_classify_checkout_completed() {
        let action = classify_event(&event(
            CHECKOUT_SESSION_COMPLETED,
            json!({"customer": "cus_1", "status": "complete", "subscription": "sub_1"}),
        ))
        .unwrap();
        assert_eq!(
            action,
            WebhookAction::CompleteCheckout {
                customer_id: "cus_1".to_string(),
                subscription_id: "sub_1".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_checkout_rejects_incomplete_or_missing_fields() {
        for object in [
            json!({"customer": "cus_1", "status": "open", "subscription": "sub_1"}),
            json!({"customer": "cus_1", "status": "complete"}),
            json!({"status": "complete", "subscription": "sub_1"}),
            json!({"customer": "", "status": "complete", "subscription": "sub_1"}),
        ] {
            let err = classify_event(&event(CHECKOUT_SESSION_COMPLETED, object)).unwrap_err();
            assert!(matches!(err, BillingError::WebhookEventNotSupported(_)));
        }
    }

    #[test]
    fn test_classify_subscription_updated() {
        for type_ in [CUSTOMER_SUBSCRIPTION_CREATED, CUSTOMER_SUBSCRIPTION_UPDATED] {
            let action = classify_event(&event(
                type_,
                json!({"id": "sub_1", "customer": "cus_1", "status": "past_due"}),
            ))
            .unwrap();
            assert_eq!(
                action,
                WebhookAction::UpdateStatus {
                    subscription_id: "sub_1".to_string(),
                    status: SubscriptionStatus::PastDue,
                }
            );
        }

        let err = classify_event(&event(
            CUSTOMER_SUBSCRIPTION_UPDATED,
            json!({"id": "sub_1", "status": "paused_forever"}),
        ))
        .unwrap_err();
        assert!(matches!(err, BillingError::WebhookEventNotSupported(_)));
    }

    #[test]
    fn test_classify_subscription_deleted_requires_canceled() {
        let action = classify_event(&event(
            CUSTOMER_SUBSCRIPTION_DELETED,
            json!({"id": "sub_1", "status": "canceled"}),
        ))
        .unwrap();
        assert_eq!(
            action,
            WebhookAction::CancelSubscription {
                subscription_id: "sub_1".to_string()
            }
        );

        assert!(classify_event(&event(
            CUSTOMER_SUBSCRIPTION_DELETED,
            json!({"id": "sub_1", "status": "active"}),
        ))
        .is_err());
    }

    #[test]
    fn test_classify_customer_deleted_and_unknown() {
        assert_eq!(
            classify_event(&event(CUSTOMER_DELETED, json!({"id": "cus_1"}))).unwrap(),
            WebhookAction::DeleteCustomer {
                customer_id: "cus_1".to_string()
            }
        );
        assert!(classify_event(&event(CUSTOMER_DELETED, json!({}))).is_err());

        assert_eq!(
            classify_event(&event("invoice.paid", json!({"id": "in_1"}))).unwrap(),
            WebhookAction::Ignore {
                event_type: "invoice.paid".to_string()
            }
        );
    }

    mod db {
        use super::*;
        use crate::mock::MockBillingApi;

        fn handler(pool: PgPool) -> WebhookHandler {
            WebhookHandler::new(Arc::new(MockBillingApi::new("pk", "whsec")), pool)
        }

        async fn create_organization(pool: &PgPool, customer_id: &str) {
            sqlx::query(
                r#"
                INSERT INTO organizations (name, display_name, orgtype, customer_id)
                VALUES ('acme', 'Acme', 'Company', $1)
                "#,
            )
            .bind(customer_id)
            .execute(pool)
            .await
            .unwrap();
        }

        fn completed(customer_id: &str, subscription_id: &str) -> WebhookEvent {
            event(
                CHECKOUT_SESSION_COMPLETED,
                json!({"customer": customer_id, "status": "complete", "subscription": subscription_id}),
            )
        }

        #[sqlx::test(migrations = "../../migrations")]
        #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
        async fn test_checkout_completed_creates_subscription_once(pool: PgPool) {
            create_organization(&pool, "cus_1").await;
            let handler = handler(pool.clone());
            let subscriptions = SubscriptionService::new(pool);

            let event = completed("cus_1", "sub_1");
            assert!(matches!(
                handler.handle_event(&event).await.unwrap(),
                WebhookOutcome::Applied(WebhookAction::CompleteCheckout { .. })
            ));
            assert_eq!(
                handler.handle_event(&event).await.unwrap(),
                WebhookOutcome::Duplicate
            );

            let all = subscriptions.get_subscriptions_by_customer("cus_1").await.unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].status, SubscriptionStatus::Active);

            let records = handler.list_webhooks(Some("success"), 10, 0).await.unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].event_id, event.id);
        }

        #[sqlx::test(migrations = "../../migrations")]
        #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
        async fn test_status_lifecycle(pool: PgPool) {
            create_organization(&pool, "cus_1").await;
            let handler = handler(pool.clone());
            let subscriptions = SubscriptionService::new(pool);

            handler.handle_event(&completed("cus_1", "sub_1")).await.unwrap();
            let id = subscriptions.find_subscriptionid("sub_1").await.unwrap().unwrap();

            handler
                .handle_event(&event(
                    CUSTOMER_SUBSCRIPTION_UPDATED,
                    json!({"id": "sub_1", "customer": "cus_1", "status": "past_due"}),
                ))
                .await
                .unwrap();
            let sub = subscriptions.get_subscription(id).await.unwrap().unwrap();
            assert_eq!(sub.status, SubscriptionStatus::PastDue);

            handler
                .handle_event(&event(
                    CUSTOMER_SUBSCRIPTION_DELETED,
                    json!({"id": "sub_1", "customer": "cus_1", "status": "canceled"}),
                ))
                .await
                .unwrap();
            let sub = subscriptions.get_subscription(id).await.unwrap().unwrap();
            assert_eq!(sub.status, SubscriptionStatus::Canceled);

            // Completing checkout again reactivates the known subscription
            handler.handle_event(&completed("cus_1", "sub_1")).await.unwrap();
            let sub = subscriptions.get_subscription(id).await.unwrap().unwrap();
            assert_eq!(sub.status, SubscriptionStatus::Active);
        }

        #[sqlx::test(migrations = "../../migrations")]
        #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
        async fn test_customer_deleted(pool: PgPool) {
            create_organization(&pool, "cus_1").await;
            let handler = handler(pool.clone());
            let subscriptions = SubscriptionService::new(pool);

            handler.handle_event(&completed("cus_1", "sub_1")).await.unwrap();
            handler
                .handle_event(&event(CUSTOMER_DELETED, json!({"id": "cus_1"})))
                .await
                .unwrap();

            assert!(subscriptions
                .get_subscriptions_by_customer("cus_1")
                .await
                .unwrap()
                .is_empty());
            assert!(subscriptions
                .get_organization_by_customer("cus_1")
                .await
                .unwrap()
                .is_none());
        }

        async fn insert_claim(pool: &PgPool, event: &WebhookEvent, age_minutes: i32) {
            sqlx::query(
                r#"
                INSERT INTO billing_webhook_events
                    (event_id, event_type, processing_result, processing_started_at)
                VALUES ($1, $2, 'processing', NOW() - make_interval(mins => $3))
                "#,
            )
            .bind(&event.id)
            .bind(&event.type_)
            .bind(age_minutes)
            .execute(pool)
            .await
            .unwrap();
        }

        #[sqlx::test(migrations = "../../migrations")]
        #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
        async fn test_abandoned_claim_is_taken_over(pool: PgPool) {
            create_organization(&pool, "cus_1").await;
            let handler = handler(pool.clone());
            let subscriptions = SubscriptionService::new(pool.clone());

            let event = completed("cus_1", "sub_crash");
            insert_claim(&pool, &event, 24 * 60).await;

            assert!(matches!(
                handler.handle_event(&event).await.unwrap(),
                WebhookOutcome::Applied(WebhookAction::CompleteCheckout { .. })
            ));
            assert_eq!(
                subscriptions
                    .get_subscriptions_by_customer("cus_1")
                    .await
                    .unwrap()
                    .len(),
                1
            );
            assert_eq!(
                handler.list_webhooks(Some("success"), 10, 0).await.unwrap().len(),
                1
            );
        }

        #[sqlx::test(migrations = "../../migrations")]
        #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
        async fn test_recent_claim_is_duplicate(pool: PgPool) {
            create_organization(&pool, "cus_1").await;
            let handler = handler(pool.clone());

            let event = completed("cus_1", "sub_busy");
            insert_claim(&pool, &event, 1).await;

            assert_eq!(
                handler.handle_event(&event).await.unwrap(),
                WebhookOutcome::Duplicate
            );
        }

        #[sqlx::test(migrations = "../../migrations")]
        #[ignore = "requires DATABASE_URL pointing at a Postgres instance"]
        async fn test_failed_event_is_recorded_and_can_be_retried(pool: PgPool) {
            let handler = handler(pool.clone());
            let event = completed("cus_late", "sub_1");

            assert!(handler.handle_event(&event).await.is_err());
            let failed = handler.list_webhooks(Some("error"), 10, 0).await.unwrap();
            assert_eq!(failed.len(), 1);
            assert!(failed[0].error_message.is_some());

            create_organization(&pool, "cus_late").await;
            assert!(matches!(
                handler.handle_event(&event).await.unwrap(),
                WebhookOutcome::Applied(_)
            ));
            assert!(handler
                .list_webhooks(Some("error"), 10, 0)
                .await
                .unwrap()
                .is_empty());
        }
    }
}
