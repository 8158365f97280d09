use super::{
    construct_event, unix_now, CheckoutLineItem, CheckoutMode, CheckoutSession,
    CreateCheckoutSessionRequest, StripeEvent, StripeService, StripeServiceError,
    SubscriptionInfo,
};
use async_trait::async_trait;

pub struct LiveStripeService {
    client: stripe::Client,
    webhook_secret: String,
}

impl LiveStripeService {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        let client = stripe::Client::new(secret_key);
        Self {
            client,
            webhook_secret: webhook_secret.into(),
        }
    }

    pub fn from_settings(settings: &crate::config::StripeSettings) -> Self {
        Self::new(settings.secret_key.clone(), settings.webhook_secret.clone())
    }
}

fn map_mode(mode: CheckoutMode) -> stripe::CheckoutSessionMode {
    match mode {
        CheckoutMode::Payment => stripe::CheckoutSessionMode::Payment,
        CheckoutMode::Subscription => stripe::CheckoutSessionMode::Subscription,
    }
}

fn map_line_items(items: &[CheckoutLineItem]) -> Vec<stripe::CreateCheckoutSessionLineItems> {
    items
        .iter()
        .map(|li| stripe::CreateCheckoutSessionLineItems {
            price: Some(li.price.clone()),
            quantity: Some(li.quantity),
            ..Default::default()
        })
        .collect()
}

fn parse_customer_id(customer_id: &str) -> Result<stripe::CustomerId, StripeServiceError> {
    customer_id
        .parse::<stripe::CustomerId>()
        .map_err(|e| StripeServiceError::Other(e.to_string()))
}

#[async_trait]
impl StripeService for LiveStripeService {
    async fn create_checkout_session(
        &self,
        req: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession, StripeServiceError> {
        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(map_mode(req.mode));
        params.success_url = Some(&req.success_url);
        params.cancel_url = Some(&req.cancel_url);
        if let Some(ref id) = req.client_reference_id {
            params.client_reference_id = Some(id);
        }
        if let Some(ref customer) = req.customer {
            params.customer = Some(parse_customer_id(customer)?);
        }
        if let Some(ref meta) = req.metadata {
            params.metadata = Some(meta.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        }
        if !req.line_items.is_empty() {
            params.line_items = Some(map_line_items(&req.line_items));
        }

        let session = stripe::CheckoutSession::create(&self.client, params).await?;
        Ok(CheckoutSession {
            id: session.id.to_string(),
            url: session.url.clone(),
        })
    }

    async fn create_customer(
        &self,
        email: Option<&str>,
        user_id: &str,
    ) -> Result<String, StripeServiceError> {
        let mut params = stripe::CreateCustomer::new();
        params.email = email;
        params.metadata = Some(
            [("user_id".to_string(), user_id.to_string())]
                .into_iter()
                .collect(),
        );
        let customer = stripe::Customer::create(&self.client, params).await?;
        Ok(customer.id.to_string())
    }

    async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, StripeServiceError> {
        let mut params = stripe::CreateBillingPortalSession::new(parse_customer_id(customer_id)?);
        params.return_url = Some(return_url);
        let session = stripe::BillingPortalSession::create(&self.client, params).await?;
        Ok(session.url)
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        construct_event(payload, signature_header, &self.webhook_secret, unix_now())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        let sub_id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| StripeServiceError::Other(e.to_string()))?;
        let sub = stripe::Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        Ok(SubscriptionInfo {
            id: sub.id.to_string(),
            status: sub.status.to_string(),
            current_period_end: sub.current_period_end,
            cancel_at: sub.cancel_at,
            cancel_at_period_end: sub.cancel_at_period_end,
        })
    }
}
