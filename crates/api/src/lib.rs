// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Registry API Library
//!
//! HTTP surface over the billing library: checkout and portal sessions,
//! subscription listing, the provider webhook and the mock checkout trigger.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
