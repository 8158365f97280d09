//! Key-provisioning service: issues API keys and adjusts their spending limits.
//!
//! Limits and usage are expressed in the service's native credit unit.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const CUSTOMER_KEY_NAME: &str = "Customer Key";

#[derive(Debug, Error)]
pub enum KeyServiceError {
    #[error("key provisioning credential is not configured")]
    MissingCredential,
    #[error("key service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("key service responded with status {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("key service returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl KeyServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeyServiceError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Current state of a key as reported by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KeySnapshot {
    pub usage: f64,
    pub limit: f64,
}

impl KeySnapshot {
    /// Credits still spendable on the key, never negative.
    pub fn remaining(&self) -> f64 {
        (self.limit - self.usage).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateKeyRequest {
    pub name: String,
    pub label: String,
    pub limit: f64,
}

impl CreateKeyRequest {
    pub fn for_customer(user_id: &str, limit: f64) -> Self {
        Self {
            name: CUSTOMER_KEY_NAME.to_string(),
            label: format!("customer-{user_id}"),
            limit,
        }
    }
}

/// A newly created key. `key` is the secret and is only returned once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedKey {
    pub hash: String,
    pub key: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyProvisioner: Send + Sync {
    async fn get_key(&self, hash: &str) -> Result<KeySnapshot, KeyServiceError>;

    async fn create_key(&self, req: CreateKeyRequest) -> Result<IssuedKey, KeyServiceError>;

    async fn update_key_limit(&self, hash: &str, limit: f64) -> Result<(), KeyServiceError>;
}

mod client;
#[cfg(test)]
mod memory;

pub use client::OpenRouterClient;
#[cfg(test)]
pub use memory::InMemoryKeyProvisioner;
