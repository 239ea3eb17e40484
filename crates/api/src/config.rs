//! Server configuration

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Server settings loaded from the environment
///
/// Provider settings (`BILLING_BACKEND`, `SUBSCRIPTION_*`) are read by the
/// billing crate.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Public base URL used for provider redirects
    pub app_base_url: String,
    /// Origins allowed by CORS; defaults to the app base URL
    pub allowed_origins: Vec<String>,
    /// Apply pending migrations at startup
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let app_base_url = get("APP_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let allowed_origins = match get("CORS_ALLOWED_ORIGINS") {
            Some(list) => list
                .split(',')
                .map(|origin| origin.trim().trim_end_matches('/').to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            None => vec![app_base_url.clone()],
        };

        let run_migrations = match get("RUN_MIGRATIONS").as_deref() {
            None => true,
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => true,
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => false,
            Some(v) => {
                return Err(ConfigError::Invalid {
                    key: "RUN_MIGRATIONS",
                    value: v.to_string(),
                })
            }
        };

        Ok(Self {
            database_url,
            bind_address: get("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            app_base_url,
            allowed_origins,
            run_migrations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://db/registry")])).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.app_base_url, "http://localhost:8080");
        assert_eq!(config.allowed_origins, vec!["http://localhost:8080".to_string()]);
        assert!(config.run_migrations);
    }

    #[test]
    fn test_database_url_required() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/registry"),
            ("BIND_ADDRESS", "127.0.0.1:9000"),
            ("APP_BASE_URL", "https://pypi.example/"),
            ("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example/"),
            ("RUN_MIGRATIONS", "false"),
        ]))
        .unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.app_base_url, "https://pypi.example");
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert!(!config.run_migrations);

        assert!(Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/registry"),
            ("RUN_MIGRATIONS", "maybe"),
        ]))
        .is_err());
    }
}
