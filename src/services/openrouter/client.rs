use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::{CreateKeyRequest, IssuedKey, KeyProvisioner, KeyServiceError, KeySnapshot};
use crate::config::OpenRouterSettings;

#[derive(Clone)]
pub struct OpenRouterClient {
    http: Client,
    base_url: String,
    provisioning_key: Option<String>,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("base_url", &self.base_url)
            .field("has_provisioning_key", &self.provisioning_key.is_some())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyEnvelope {
    data: KeyData,
}

#[derive(Debug, Deserialize)]
struct KeyData {
    #[serde(default)]
    usage: Option<f64>,
    #[serde(default)]
    limit: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CreatedKeyEnvelope {
    data: CreatedKeyData,
    key: String,
}

#[derive(Debug, Deserialize)]
struct CreatedKeyData {
    hash: String,
}

impl OpenRouterClient {
    pub fn new(
        base_url: impl Into<String>,
        provisioning_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, KeyServiceError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provisioning_key: provisioning_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn from_settings(settings: &OpenRouterSettings) -> Result<Self, KeyServiceError> {
        Self::new(
            settings.base_url.clone(),
            settings.provisioning_key.clone(),
            settings.timeout,
        )
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, KeyServiceError> {
        let key = self
            .provisioning_key
            .as_deref()
            .ok_or(KeyServiceError::MissingCredential)?;
        Ok(request
            .bearer_auth(key)
            .header(reqwest::header::CONTENT_TYPE, "application/json"))
    }

    fn key_url(&self, hash: &str) -> String {
        format!("{}/keys/{}", self.base_url, hash)
    }
}

async fn send_request<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, KeyServiceError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if !status.is_success() {
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .ok()
            .and_then(|env| env.error)
            .and_then(|err| err.message)
            .map(|msg| msg.trim().to_string())
            .filter(|msg| !msg.is_empty())
            .or_else(|| {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .unwrap_or_else(|| "key service request failed".to_string());
        return Err(KeyServiceError::Api { status, message });
    }

    let body = if body.trim().is_empty() { "null" } else { body.as_str() };
    serde_json::from_str::<T>(body).map_err(|err| KeyServiceError::InvalidResponse(err.to_string()))
}

#[async_trait]
impl KeyProvisioner for OpenRouterClient {
    async fn get_key(&self, hash: &str) -> Result<KeySnapshot, KeyServiceError> {
        let request = self.authorized(self.http.get(self.key_url(hash)))?;
        let envelope: KeyEnvelope = send_request(request).await?;
        Ok(KeySnapshot {
            usage: envelope.data.usage.unwrap_or(0.0),
            limit: envelope.data.limit.unwrap_or(0.0),
        })
    }

    async fn create_key(&self, req: CreateKeyRequest) -> Result<IssuedKey, KeyServiceError> {
        let url = format!("{}/keys", self.base_url);
        let request = self.authorized(self.http.post(url))?.json(&req);
        let envelope: CreatedKeyEnvelope = send_request(request).await?;
        if envelope.data.hash.is_empty() || envelope.key.is_empty() {
            return Err(KeyServiceError::InvalidResponse(
                "created key is missing its hash or secret".into(),
            ));
        }
        Ok(IssuedKey {
            hash: envelope.data.hash,
            key: envelope.key,
        })
    }

    async fn update_key_limit(&self, hash: &str, limit: f64) -> Result<(), KeyServiceError> {
        let request = self
            .authorized(self.http.patch(self.key_url(hash)))?
            .json(&json!({ "limit": limit }));
        let _: serde_json::Value = send_request(request).await?;
        Ok(())
    }
}
