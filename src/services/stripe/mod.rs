// NOTE: async-stripe is compiled with a minimal feature set (runtime-tokio-hyper, checkout,
// billing for the customer portal and subscriptions, connect to satisfy payload types).
// Webhooks are verified over the raw body and read as untyped JSON, so the crate's
// webhook-events feature is not enabled. Touching APIs outside those features will
// require updating Cargo.toml explicitly.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::webhook_signature::{verify_signature, SignatureError, DEFAULT_TOLERANCE_SECS};

#[derive(Debug, thiserror::Error)]
pub enum StripeServiceError {
    #[error("stripe api error: {0}")]
    Api(String),
    #[error("webhook verification failed: {0}")]
    Webhook(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<stripe::StripeError> for StripeServiceError {
    fn from(err: stripe::StripeError) -> Self {
        StripeServiceError::Api(err.to_string())
    }
}

impl From<SignatureError> for StripeServiceError {
    fn from(err: SignatureError) -> Self {
        StripeServiceError::Webhook(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Payment,
    Subscription,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutLineItem {
    pub price: String,
    pub quantity: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateCheckoutSessionRequest {
    pub success_url: String,
    pub cancel_url: String,
    pub mode: CheckoutMode,
    pub line_items: Vec<CheckoutLineItem>,
    pub client_reference_id: Option<String>,
    pub customer: Option<String>,
    pub metadata: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// A verified webhook event. `payload` is the full event body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    pub r#type: String,
    pub payload: Value,
}

static NULL_OBJECT: Value = Value::Null;

impl StripeEvent {
    /// The event's `data.object`, or `null` when absent.
    pub fn object(&self) -> &Value {
        self.payload
            .get("data")
            .and_then(|data| data.get("object"))
            .unwrap_or(&NULL_OBJECT)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub status: String,
    /// Unix timestamp (seconds) when the current period ends
    pub current_period_end: i64,
    /// Unix timestamp (seconds) when the subscription will cancel, if set
    pub cancel_at: Option<i64>,
    pub cancel_at_period_end: bool,
}

#[async_trait]
pub trait StripeService: Send + Sync {
    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError>;

    /// Creates a gateway customer tagged with our user id.
    async fn create_customer(
        &self,
        email: Option<&str>,
        user_id: &str,
    ) -> Result<String, StripeServiceError>;

    /// Returns the URL of a self-service billing portal session.
    async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, StripeServiceError>;

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, StripeServiceError>;
}

/// Verifies the signature over the raw bytes, then parses the event envelope.
pub fn construct_event(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    now: i64,
) -> Result<StripeEvent, StripeServiceError> {
    verify_signature(payload, signature_header, secret, DEFAULT_TOLERANCE_SECS, now)?;
    parse_event(payload)
}

fn parse_event(payload: &[u8]) -> Result<StripeEvent, StripeServiceError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| StripeServiceError::Serde(e.to_string()))?;
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StripeServiceError::Serde("event is missing its id".into()))?
        .to_string();
    let r#type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| StripeServiceError::Serde("event is missing its type".into()))?
        .to_string();
    Ok(StripeEvent {
        id,
        r#type,
        payload: value,
    })
}

pub(crate) fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

mod live;
#[cfg(test)]
mod mock;

pub use live::LiveStripeService;
#[cfg(test)]
pub use mock::MockStripeService;
