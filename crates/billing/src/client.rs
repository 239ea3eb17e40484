//! Payment provider configuration and HTTP client

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};

/// Provider API version the HTTP client sends with every request
///
/// `SUBSCRIPTION_API_VERSION` must name this version for backends that talk
/// to the provider API.
pub fn client_api_version() -> &'static str {
    stripe::generated::core::version::VERSION.as_str()
}

/// Which billing implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingBackend {
    /// Live provider API
    Stripe,
    /// Provider API served from `api_base` (e.g. a stripe-mock container)
    Local,
    /// In-process mock, no network access
    Mock,
}

impl BillingBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingBackend::Stripe => "stripe",
            BillingBackend::Local => "local",
            BillingBackend::Mock => "mock",
        }
    }
}

impl std::fmt::Display for BillingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingBackend {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stripe" | "live" => Ok(BillingBackend::Stripe),
            "local" => Ok(BillingBackend::Local),
            "mock" => Ok(BillingBackend::Mock),
            other => Err(BillingError::Config(format!(
                "No billing service implemented for backend '{}'",
                other
            ))),
        }
    }
}

/// Payment provider settings
#[derive(Clone)]
pub struct StripeConfig {
    pub backend: BillingBackend,
    /// Override of the provider base URL, honored by the local backend only
    pub api_base: Option<String>,
    pub api_version: String,
    pub secret_key: String,
    pub publishable_key: String,
    pub webhook_secret: String,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("backend", &self.backend)
            .field("api_base", &self.api_base)
            .field("api_version", &self.api_version)
            .field("secret_key", &"[redacted]")
            .field("publishable_key", &self.publishable_key)
            .field("webhook_secret", &"[redacted]")
            .finish()
    }
}

impl StripeConfig {
    /// Load provider settings from `SUBSCRIPTION_*` environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load provider settings through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend: BillingBackend = get("BILLING_BACKEND")
            .ok_or_else(|| BillingError::Config("BILLING_BACKEND must be set".to_string()))?
            .parse()?;

        let api_base = get("SUBSCRIPTION_API_BASE");
        if backend == BillingBackend::Local && api_base.is_none() {
            return Err(BillingError::Config(
                "SUBSCRIPTION_API_BASE is required for the local billing backend".to_string(),
            ));
        }

        let require = |key: &str| -> BillingResult<String> {
            get(key).ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
        };

        let api_version = match get("SUBSCRIPTION_API_VERSION") {
            Some(version) => version,
            None if backend == BillingBackend::Mock => client_api_version().to_string(),
            None => {
                return Err(BillingError::Config(
                    "SUBSCRIPTION_API_VERSION must be set".to_string(),
                ))
            }
        };
        if backend != BillingBackend::Mock && api_version != client_api_version() {
            return Err(BillingError::Config(format!(
                "SUBSCRIPTION_API_VERSION {} does not match the client API version {}",
                api_version,
                client_api_version()
            )));
        }

        // The mock backend never authenticates against the provider
        let secret_key = match backend {
            BillingBackend::Mock => get("SUBSCRIPTION_SECRET_KEY").unwrap_or_default(),
            _ => require("SUBSCRIPTION_SECRET_KEY")?,
        };

        Ok(Self {
            backend,
            api_base,
            api_version,
            secret_key,
            publishable_key: get("SUBSCRIPTION_PUBLISHABLE_KEY").unwrap_or_default(),
            webhook_secret: require("SUBSCRIPTION_WEBHOOK_KEY")?,
        })
    }
}

/// Shared handle to the provider HTTP client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = match (config.backend, config.api_base.as_deref()) {
            (BillingBackend::Local, Some(api_base)) => {
                tracing::info!(api_base = %api_base, "Using local billing API endpoint");
                stripe::Client::from_url(api_base, config.secret_key.clone())
            }
            _ => stripe::Client::new(config.secret_key.clone()),
        };

        tracing::debug!(
            backend = %config.backend,
            api_version = %client_api_version(),
            "Billing API client created"
        );

        Self {
            inner,
            config: Arc::new(config),
        }
    }

    /// Create a client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
