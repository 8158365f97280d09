use super::{
    construct_event, parse_event, unix_now, CheckoutSession, CreateCheckoutSessionRequest,
    StripeEvent, StripeService, StripeServiceError, SubscriptionInfo,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Default)]
pub struct MockStripeService {
    pub created_sessions: Arc<Mutex<Vec<CheckoutSession>>>,
    pub last_create_requests: Arc<Mutex<Vec<CreateCheckoutSessionRequest>>>,
    /// `(email, user_id, customer_id)` for every customer created.
    pub created_customers: Arc<Mutex<Vec<(Option<String>, String, String)>>>,
    pub portal_requests: Arc<Mutex<Vec<(String, String)>>>,
    pub subscriptions: Arc<Mutex<HashMap<String, SubscriptionInfo>>>,
    pub fail_api_calls: Arc<Mutex<bool>>,
    webhook_secret: Option<String>,
}

impl MockStripeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies signatures like the live service instead of trusting every payload.
    pub fn with_webhook_secret(mut self, secret: &str) -> Self {
        self.webhook_secret = Some(secret.to_string());
        self
    }

    pub fn insert_subscription(&self, id: &str, current_period_end: i64) {
        let sub = SubscriptionInfo {
            id: id.to_string(),
            status: "active".into(),
            current_period_end,
            cancel_at: None,
            cancel_at_period_end: false,
        };
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id.to_string(), sub);
    }

    fn check_failure(&self) -> Result<(), StripeServiceError> {
        if *self.fail_api_calls.lock().unwrap() {
            Err(StripeServiceError::Api("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

static ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn make_id(prefix: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}{}", prefix, ts, n)
}

#[async_trait]
impl StripeService for MockStripeService {
    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError> {
        self.check_failure()?;
        // capture the request
        self.last_create_requests.lock().unwrap().push(req.clone());

        let session = CheckoutSession {
            id: make_id("cs_test"),
            url: Some("https://example.test/checkout".into()),
        };
        self.created_sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }

    async fn create_customer(
        &self,
        email: Option<&str>,
        user_id: &str,
    ) -> Result<String, StripeServiceError> {
        self.check_failure()?;
        let id = make_id("cus_test");
        self.created_customers.lock().unwrap().push((
            email.map(str::to_string),
            user_id.to_string(),
            id.clone(),
        ));
        Ok(id)
    }

    async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, StripeServiceError> {
        self.check_failure()?;
        self.portal_requests
            .lock()
            .unwrap()
            .push((customer_id.to_string(), return_url.to_string()));
        Ok(format!("https://billing.example.test/session/{customer_id}"))
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        match &self.webhook_secret {
            Some(secret) => construct_event(payload, signature_header, secret, unix_now()),
            None => parse_event(payload),
        }
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        self.check_failure()?;
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                StripeServiceError::NotFound(format!("subscription {subscription_id} not found"))
            })
    }
}
