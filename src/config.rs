use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::models::plan::PLANS;
use crate::services::openrouter::{DEFAULT_TIMEOUT_SECS, OPENROUTER_BASE_URL};
use crate::services::provisioning::KeyReadFailurePolicy;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_EVENT_RETENTION_DAYS: u64 = 30;
pub const DEFAULT_JWT_ISSUER: &str = "agentic-billing";
pub const DEFAULT_JWT_AUDIENCE: &str = "agentic-billing-api";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct StripeSettings {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Plan id -> Stripe price id. Plans without an entry cannot be purchased.
    pub price_ids: HashMap<String, String>,
}

impl StripeSettings {
    pub fn price_id(&self, plan_id: &str) -> Option<&str> {
        self.price_ids.get(plan_id).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterSettings {
    pub base_url: String,
    /// Absent in environments that must not provision; provisioning then fails
    /// with a configuration error.
    pub provisioning_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub stripe: StripeSettings,
    pub openrouter: OpenRouterSettings,
    pub key_read_failure_policy: KeyReadFailurePolicy,
    /// Native credits granted once by the bootstrap callable; zero disables it.
    pub starter_credits: f64,
    pub stripe_event_retention: Duration,
    pub jwt_issuer: String,
    pub jwt_audience: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let database_url = required("DATABASE_URL")?;
        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let allowed_origins = get("ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let price_ids = PLANS
            .iter()
            .filter_map(|plan| {
                get(plan.price_env_var().as_str()).map(|price| (plan.id.to_string(), price))
            })
            .collect();
        let stripe = StripeSettings {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            price_ids,
        };

        let timeout_secs = parse_or(
            "OPENROUTER_TIMEOUT_SECS",
            get("OPENROUTER_TIMEOUT_SECS"),
            DEFAULT_TIMEOUT_SECS,
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "OPENROUTER_TIMEOUT_SECS",
                reason: "must be greater than zero".into(),
            });
        }
        let openrouter = OpenRouterSettings {
            base_url: get("OPENROUTER_BASE_URL").unwrap_or_else(|| OPENROUTER_BASE_URL.to_string()),
            provisioning_key: get("OPENROUTER_PROVISIONING_KEY"),
            timeout: Duration::from_secs(timeout_secs),
        };

        let key_read_failure_policy = match get("KEY_READ_FAILURE_POLICY") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                name: "KEY_READ_FAILURE_POLICY",
                reason,
            })?,
            None => KeyReadFailurePolicy::default(),
        };

        let starter_credits: f64 = parse_or("STARTER_CREDITS", get("STARTER_CREDITS"), 0.0)?;
        if !starter_credits.is_finite() || starter_credits < 0.0 {
            return Err(ConfigError::Invalid {
                name: "STARTER_CREDITS",
                reason: "must be a non-negative number".into(),
            });
        }

        let retention_days = parse_or(
            "STRIPE_EVENT_RETENTION_DAYS",
            get("STRIPE_EVENT_RETENTION_DAYS"),
            DEFAULT_EVENT_RETENTION_DAYS,
        )?;

        Ok(Config {
            database_url,
            bind_addr,
            allowed_origins,
            stripe,
            openrouter,
            key_read_failure_policy,
            starter_credits,
            stripe_event_retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            jwt_issuer: get("JWT_ISSUER").unwrap_or_else(|| DEFAULT_JWT_ISSUER.to_string()),
            jwt_audience: get("JWT_AUDIENCE").unwrap_or_else(|| DEFAULT_JWT_AUDIENCE.to_string()),
        })
    }
}

fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.parse::<T>().map_err(|err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}
