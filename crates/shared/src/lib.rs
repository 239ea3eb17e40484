// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Registry shared types and database plumbing
//!
//! Used by the billing library, the API server and the background worker.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations, DbError};
pub use types::{
    Organization, OrganizationType, SubscriptionPriceInterval, SubscriptionStatus,
};
