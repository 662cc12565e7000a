//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `STRIPE_SECRET_KEY` - Stripe secret API key
//! - `STRIPE_WEBHOOK_SECRET` - Webhook endpoint signing secret
//! - `DATABASE_URL` (or `NETLIFY_DATABASE_URL`) - `PostgreSQL` connection string
//!
//! ## Optional
//! - `APP_BASE_URL` (or `VITE_APP_URL`) - Public storefront URL (default: http://localhost:8888)
//! - `CHECKOUT_CURRENCY` - ISO currency for sessions (default: eur)
//! - `CHECKOUT_LOCALE` - Hosted checkout locale (default: es)
//! - `CHECKOUT_MAX_QUANTITY` - Per-line quantity cap (default: 10)
//! - `DEFAULT_CUSTOMER_EMAIL` - Email used when the cart omits one
//! - `ALLOWED_ORIGINS` - Comma-separated origins for the verification endpoint
//! - `WEBHOOK_TOLERANCE_SECS` - Signature timestamp tolerance (default: 300)
//! - `BIND_ADDR` - Listen address (default: 0.0.0.0:8888)
//! - `RUN_MIGRATIONS` - Apply SQL migrations at start-up (default: false)
//! - `DATABASE_MAX_CONNECTIONS` - Pool size (default: 10)
//! - `LOG_FORMAT` - `json` for structured output, text otherwise

use std::net::SocketAddr;
use std::str::FromStr;

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

use hackeed_core::DEFAULT_MAX_QUANTITY;
use hackeed_payments::{CheckoutSettings, DEFAULT_TOLERANCE_SECS};

const DEFAULT_BASE_URL: &str = "http://localhost:8888";
const DEFAULT_PORT: u16 = 8888;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration.
///
/// `SecretString` keeps the credentials out of `Debug` output.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub stripe_secret_key: SecretString,
    pub webhook_secret: SecretString,
    pub database_url: SecretString,
    pub base_url: Url,
    pub currency: String,
    pub locale: String,
    pub max_quantity: i32,
    pub default_customer_email: Option<String>,
    pub allowed_origins: Vec<String>,
    pub webhook_tolerance_secs: i64,
    pub bind_addr: SocketAddr,
    pub run_migrations: bool,
    pub database_max_connections: u32,
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let base_url_raw = env
            .first_of(&["APP_BASE_URL", "VITE_APP_URL"])
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(&base_url_raw)
            .map_err(|e| ConfigError::InvalidEnvVar("APP_BASE_URL".into(), e.to_string()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEnvVar(
                "APP_BASE_URL".into(),
                format!("unsupported scheme '{}'", base_url.scheme()),
            ));
        }

        let max_quantity: i32 = env.parsed_or("CHECKOUT_MAX_QUANTITY", DEFAULT_MAX_QUANTITY)?;
        if max_quantity < 1 {
            return Err(ConfigError::InvalidEnvVar(
                "CHECKOUT_MAX_QUANTITY".into(),
                "must be at least 1".into(),
            ));
        }

        let log_format = match env.optional("LOG_FORMAT").as_deref() {
            Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            stripe_secret_key: env.required_secret("STRIPE_SECRET_KEY")?,
            webhook_secret: env.required_secret("STRIPE_WEBHOOK_SECRET")?,
            database_url: env
                .first_of(&["DATABASE_URL", "NETLIFY_DATABASE_URL"])
                .map(SecretString::from)
                .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".into()))?,
            allowed_origins: env
                .optional("ALLOWED_ORIGINS")
                .map(|origins| split_list(&origins))
                .unwrap_or_else(|| vec![origin_of(&base_url)]),
            base_url,
            currency: env
                .optional("CHECKOUT_CURRENCY")
                .unwrap_or_else(|| "eur".into())
                .to_ascii_lowercase(),
            locale: env.optional("CHECKOUT_LOCALE").unwrap_or_else(|| "es".into()),
            max_quantity,
            default_customer_email: env.optional("DEFAULT_CUSTOMER_EMAIL"),
            webhook_tolerance_secs: env
                .parsed_or("WEBHOOK_TOLERANCE_SECS", DEFAULT_TOLERANCE_SECS)?,
            bind_addr: env.parsed_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))?,
            run_migrations: env.parsed_or("RUN_MIGRATIONS", false)?,
            database_max_connections: env.parsed_or("DATABASE_MAX_CONNECTIONS", 10)?,
            log_format,
        })
    }

    /// Redirect URLs and session defaults for the checkout builder
    pub fn checkout_settings(&self) -> CheckoutSettings {
        CheckoutSettings::from_base_url(self.base_url.as_str())
            .with_currency(&self.currency)
            .with_locale(&self.locale)
            .with_default_customer_email(self.default_customer_email.clone())
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty value of `key`
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.optional(key))
    }

    fn required_secret(&self, key: &str) -> Result<SecretString, ConfigError> {
        self.optional(key)
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parsed_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidEnvVar(key.to_string(), e.to_string())),
            None => Ok(default),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().trim_end_matches('/').to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// `scheme://host[:port]` of a URL
fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("STRIPE_SECRET_KEY", "sk_test_123"),
        ("STRIPE_WEBHOOK_SECRET", "whsec_123"),
        ("DATABASE_URL", "postgres://hackeed:pw@localhost/hackeed"),
    ];

    #[test]
    fn test_defaults() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.base_url.as_str(), "http://localhost:8888/");
        assert_eq!(config.currency, "eur");
        assert_eq!(config.locale, "es");
        assert_eq!(config.max_quantity, 10);
        assert_eq!(config.allowed_origins, vec!["http://localhost:8888"]);
        assert_eq!(config.webhook_tolerance_secs, 300);
        assert_eq!(config.bind_addr.port(), 8888);
        assert!(!config.run_migrations);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(
            config.checkout_settings().success_url,
            "http://localhost:8888/success?session_id={CHECKOUT_SESSION_ID}"
        );
    }

    #[test]
    fn test_missing_secret_fails_fast() {
        let err = load(&REQUIRED[1..]).unwrap_err();
        assert_eq!(err.to_string(), "Missing environment variable: STRIPE_SECRET_KEY");

        let err = load(&REQUIRED[..2]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "DATABASE_URL"));
    }

    #[test]
    fn test_aliases_and_overrides() {
        let mut vars = vec![
            ("STRIPE_SECRET_KEY", "sk_test_123"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_123"),
            ("NETLIFY_DATABASE_URL", "postgres://neon/hackeed"),
            ("VITE_APP_URL", "https://hackeed.example"),
            ("ALLOWED_ORIGINS", "https://hackeed.example/, http://localhost:8888"),
            ("CHECKOUT_CURRENCY", "EUR"),
            ("LOG_FORMAT", "JSON"),
            ("RUN_MIGRATIONS", "true"),
        ];
        let config = load(&vars).unwrap();
        assert_eq!(config.database_url.expose_secret(), "postgres://neon/hackeed");
        assert_eq!(config.base_url.host_str(), Some("hackeed.example"));
        assert_eq!(
            config.allowed_origins,
            vec!["https://hackeed.example", "http://localhost:8888"]
        );
        assert_eq!(config.currency, "eur");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.run_migrations);

        vars.push(("CHECKOUT_MAX_QUANTITY", "lots"));
        assert!(matches!(load(&vars), Err(ConfigError::InvalidEnvVar(..))));
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("APP_BASE_URL", "not a url"));
        assert!(load(&vars).is_err());

        let mut vars = REQUIRED.to_vec();
        vars.push(("APP_BASE_URL", "ftp://hackeed.example"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = load(&REQUIRED).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk_test_123"));
        assert!(!debug.contains("whsec_123"));
    }
}
