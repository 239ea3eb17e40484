//! Common types used across the registry billing services

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Subscription status as reported by the payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Trialing,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 7] = [
        Self::Active,
        Self::PastDue,
        Self::Unpaid,
        Self::Canceled,
        Self::Incomplete,
        Self::IncompleteExpired,
        Self::Trialing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Trialing => "trialing",
        }
    }

    /// Human readable label for management views
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::PastDue => "Past Due",
            Self::Unpaid => "Unpaid",
            Self::Canceled => "Canceled",
            Self::Incomplete => "Incomplete",
            Self::IncompleteExpired => "Incomplete Expired",
            Self::Trialing => "Trialing",
        }
    }

    /// Paid features are restricted for anything but active or trialing subscriptions
    pub fn is_restricted(&self) -> bool {
        !matches!(self, Self::Active | Self::Trialing)
    }

    pub fn has_value(value: &str) -> bool {
        value.parse::<Self>().is_ok()
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid subscription status: {}", s))
    }
}

/// Recurrence interval of a subscription price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPriceInterval {
    Month,
    Year,
    Week,
    Day,
}

impl Default for SubscriptionPriceInterval {
    fn default() -> Self {
        Self::Month
    }
}

impl SubscriptionPriceInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
            Self::Week => "week",
            Self::Day => "day",
        }
    }
}

impl std::fmt::Display for SubscriptionPriceInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionPriceInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            "week" => Ok(Self::Week),
            "day" => Ok(Self::Day),
            _ => Err(format!("Invalid price interval: {}", s)),
        }
    }
}

/// Kind of organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum OrganizationType {
    Community,
    Company,
}

impl Default for OrganizationType {
    fn default() -> Self {
        Self::Community
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Organization (tenant) model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub orgtype: OrganizationType,
    pub is_active: bool,
    pub is_approved: Option<bool>,
    pub date_approved: Option<OffsetDateTime>,
    /// Payment provider customer id, cleared when the customer is deleted
    pub customer_id: Option<String>,
    pub created: OffsetDateTime,
}

impl Organization {
    pub fn has_customer(&self) -> bool {
        self.customer_id.is_some()
    }
}
