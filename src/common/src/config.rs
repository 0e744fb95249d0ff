//! Configuration loading from environment variables.

use std::env;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// eBay Browse API base URL
    pub ebay_api_url: String,

    /// OAuth bearer token for the Browse API (listing refresh is skipped without it)
    pub ebay_access_token: Option<String>,

    /// Marketplace header sent with every Browse request
    pub ebay_marketplace_id: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - DATABASE_URL: PostgreSQL connection string
    ///
    /// Optional variables (with defaults):
    /// - EBAY_API_URL: Browse API base URL
    /// - EBAY_ACCESS_TOKEN: OAuth application token
    /// - EBAY_MARKETPLACE_ID: marketplace header (default: EBAY_US)
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let ebay_api_url = env::var("EBAY_API_URL")
            .unwrap_or_else(|_| "https://api.ebay.com/buy/browse/v1".to_string());
        Url::parse(&ebay_api_url).map_err(|_| ConfigError::InvalidUrl(ebay_api_url.clone()))?;

        let ebay_access_token = env::var("EBAY_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let ebay_marketplace_id =
            env::var("EBAY_MARKETPLACE_ID").unwrap_or_else(|_| "EBAY_US".to_string());

        Ok(Self {
            database_url,
            ebay_api_url: ebay_api_url.trim_end_matches('/').to_string(),
            ebay_access_token,
            ebay_marketplace_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_vars() {
        for var in [
            "DATABASE_URL",
            "EBAY_API_URL",
            "EBAY_ACCESS_TOKEN",
            "EBAY_MARKETPLACE_ID",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_config_missing_database_url() {
        clear_vars();

        // Use from_env_only to avoid .env file loading
        let result = Config::from_env_only();
        assert!(result.is_err());

        if let Err(ConfigError::MissingVar(var)) = result {
            assert_eq!(var, "DATABASE_URL");
        } else {
            panic!("Expected MissingVar error");
        }
    }

    #[test]
    #[serial]
    fn test_config_with_defaults() {
        clear_vars();
        env::set_var("DATABASE_URL", "postgres://localhost/cardpulse");

        let config = Config::from_env_only().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/cardpulse");
        assert_eq!(config.ebay_api_url, "https://api.ebay.com/buy/browse/v1");
        assert_eq!(config.ebay_marketplace_id, "EBAY_US");
        assert!(config.ebay_access_token.is_none());

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_config_rejects_invalid_api_url() {
        clear_vars();
        env::set_var("DATABASE_URL", "postgres://localhost/cardpulse");
        env::set_var("EBAY_API_URL", "not a url");

        let result = Config::from_env_only();
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));

        clear_vars();
    }

    #[test]
    #[serial]
    fn test_config_blank_token_is_none() {
        clear_vars();
        env::set_var("DATABASE_URL", "postgres://localhost/cardpulse");
        env::set_var("EBAY_ACCESS_TOKEN", "   ");
        env::set_var("EBAY_API_URL", "https://api.sandbox.ebay.com/buy/browse/v1/");

        let config = Config::from_env_only().unwrap();
        assert!(config.ebay_access_token.is_none());
        assert_eq!(config.ebay_api_url, "https://api.sandbox.ebay.com/buy/browse/v1");

        clear_vars();
    }
}
