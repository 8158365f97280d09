use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::db::ledger_repository::CustomerLink;
use crate::models::billing_event::{
    BillingEvent, CheckoutSessionObject, InvoiceObject, SubscriptionObject,
};
use crate::models::ledger::SubscriptionStatus;
use crate::models::plan::{find_plan, Plan};
use crate::responses::JsonResponse;
use crate::services::provisioning::{CreditGrant, ProvisionError, SubscriptionTerms};
use crate::state::AppState;

/// Result of handling one delivery. Only `Processed` events are recorded as
/// handled; everything else may be redelivered.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Processed,
    Ignored(&'static str),
    Duplicate,
    BadRequest(String),
    NotFound(String),
    Failed(String),
}

impl IntoResponse for WebhookOutcome {
    fn into_response(self) -> Response {
        match self {
            WebhookOutcome::Processed | WebhookOutcome::Ignored(_) | WebhookOutcome::Duplicate => {
                Json(json!({ "received": true })).into_response()
            }
            WebhookOutcome::BadRequest(msg) => JsonResponse::bad_request(&msg).into_response(),
            WebhookOutcome::NotFound(msg) => JsonResponse::not_found(&msg).into_response(),
            WebhookOutcome::Failed(msg) => JsonResponse::server_error(&msg).into_response(),
        }
    }
}

impl From<ProvisionError> for WebhookOutcome {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::NotFound(user_id) => {
                WebhookOutcome::NotFound(format!("no ledger for user {user_id}"))
            }
            // The key already moved; a redelivery would apply the grant again.
            ProvisionError::LedgerAfterKeyUpdate {
                key_hash,
                new_limit,
                source,
            } => {
                error!(
                    err = ?source,
                    %key_hash,
                    new_limit,
                    "ledger out of sync with key; event recorded to stop redelivery"
                );
                WebhookOutcome::Processed
            }
            other => {
                error!(err = ?other, "credit provisioning failed");
                WebhookOutcome::Failed("credit provisioning failed".into())
            }
        }
    }
}

fn ledger_failure(err: sqlx::Error) -> WebhookOutcome {
    error!(?err, "ledger access failed");
    WebhookOutcome::Failed("ledger access failed".into())
}

fn to_datetime(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

// POST /api/stripe/webhook
pub async fn webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let sig = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok());
    handle_event(&app_state, &body, sig).await.into_response()
}

/// Verifies, deduplicates and dispatches one webhook delivery.
pub async fn handle_event(
    state: &AppState,
    body: &[u8],
    signature: Option<&str>,
) -> WebhookOutcome {
    let Some(sig) = signature else {
        return WebhookOutcome::BadRequest("Missing Stripe-Signature".into());
    };

    let evt = match state.stripe.verify_webhook(body, sig) {
        Ok(e) => e,
        Err(err) => {
            warn!(?err, "stripe webhook verification failed");
            return WebhookOutcome::BadRequest("invalid webhook".into());
        }
    };

    // Concurrent deliveries of the same event wait for each other here.
    let _guard = state
        .provisioner
        .locks()
        .lock(&format!("stripe-event:{}", evt.id))
        .await;

    match state.stripe_events.has_processed_event(&evt.id).await {
        Ok(true) => {
            info!(event_id = %evt.id, event_type = %evt.r#type, "duplicate stripe event ignored");
            return WebhookOutcome::Duplicate;
        }
        Ok(false) => {}
        Err(err) => return ledger_failure(err),
    }

    let event = match BillingEvent::classify(&evt.r#type, evt.object()) {
        Ok(event) => event,
        Err(err) => {
            warn!(?err, event_id = %evt.id, event_type = %evt.r#type, "malformed stripe event");
            return WebhookOutcome::BadRequest(format!("malformed {} payload", evt.r#type));
        }
    };
    let kind = event.kind();

    let outcome = match event {
        BillingEvent::CheckoutCompleted(session) => checkout_completed(state, session).await,
        BillingEvent::InvoicePaid(invoice) => invoice_paid(state, invoice).await,
        BillingEvent::PaymentFailed(invoice) => payment_failed(state, invoice).await,
        BillingEvent::SubscriptionDeleted(sub) => subscription_deleted(state, sub).await,
        BillingEvent::SubscriptionUpdated(sub) => subscription_updated(state, sub).await,
        BillingEvent::Unrecognized => WebhookOutcome::Ignored("unhandled event type"),
    };

    if outcome == WebhookOutcome::Processed {
        // The grant already happened; failing here would only invite a second one.
        if let Err(err) = state.stripe_events.record_event(&evt.id, &evt.r#type).await {
            error!(?err, event_id = %evt.id, "failed to record processed stripe event");
        }
    }

    info!(event_id = %evt.id, event_type = %evt.r#type, kind, ?outcome, "stripe webhook handled");
    outcome
}

async fn user_for_customer(
    state: &AppState,
    customer: Option<&str>,
) -> Result<String, WebhookOutcome> {
    let customer =
        customer.ok_or_else(|| WebhookOutcome::BadRequest("missing customer".into()))?;
    match state.ledger.find_user_id_by_stripe_customer_id(customer).await {
        Ok(Some(user_id)) => Ok(user_id),
        Ok(None) => {
            warn!(%customer, "no ledger for stripe customer");
            Err(WebhookOutcome::NotFound(format!(
                "no user for customer {customer}"
            )))
        }
        Err(err) => Err(ledger_failure(err)),
    }
}

/// Period end of a subscription, if the gateway can tell us. Expiry is
/// informational, so lookup failures only log.
async fn subscription_period_end(
    state: &AppState,
    subscription_id: Option<&str>,
) -> Option<OffsetDateTime> {
    let id = subscription_id?;
    match state.stripe.retrieve_subscription(id).await {
        Ok(info) => to_datetime(Some(info.current_period_end)),
        Err(err) => {
            warn!(?err, subscription_id = %id, "could not retrieve subscription period");
            None
        }
    }
}

async fn checkout_completed(state: &AppState, session: CheckoutSessionObject) -> WebhookOutcome {
    let Some(user_id) = session.user_id() else {
        warn!(session_id = %session.id, "checkout.session.completed missing user id");
        return WebhookOutcome::BadRequest("missing user id".into());
    };
    let Some(plan_id) = session.plan_id() else {
        return WebhookOutcome::BadRequest("missing planId".into());
    };
    let Some(plan) = find_plan(plan_id) else {
        return WebhookOutcome::BadRequest(format!("unknown plan {plan_id}"));
    };
    if plan.is_subscription() != session.is_subscription() {
        return WebhookOutcome::BadRequest(format!(
            "plan {plan_id} does not match the session mode"
        ));
    }

    let ledger = match state.ledger.find_ledger(user_id).await {
        Ok(Some(ledger)) => ledger,
        Ok(None) => return WebhookOutcome::NotFound(format!("no ledger for user {user_id}")),
        Err(err) => return ledger_failure(err),
    };

    if let Some(customer) = session.customer.as_deref() {
        if ledger.stripe_customer_id.is_none() {
            match state.ledger.set_stripe_customer_id(user_id, customer).await {
                Ok(CustomerLink::Linked) => {}
                Ok(CustomerLink::TakenByOtherUser) => {
                    warn!(%user_id, %customer, "stripe customer already linked to another user");
                    return WebhookOutcome::BadRequest(format!(
                        "customer {customer} belongs to another user"
                    ));
                }
                Err(err) => return ledger_failure(err),
            }
        }
    }

    let terms = if plan.is_subscription() {
        Some(SubscriptionTerms {
            plan_id: plan.id.to_string(),
            expires_at: subscription_period_end(state, session.subscription.as_deref()).await,
            stripe_subscription_id: session.subscription.clone(),
        })
    } else {
        None
    };

    grant(state, user_id, plan, terms).await
}

async fn grant(
    state: &AppState,
    user_id: &str,
    plan: &Plan,
    terms: Option<SubscriptionTerms>,
) -> WebhookOutcome {
    match state
        .provisioner
        .provision(user_id, CreditGrant::for_plan(plan, terms))
        .await
    {
        Ok(outcome) => {
            info!(%user_id, plan_id = plan.id, new_limit = outcome.new_limit, "plan fulfilled");
            WebhookOutcome::Processed
        }
        Err(err) => err.into(),
    }
}

async fn invoice_paid(state: &AppState, invoice: InvoiceObject) -> WebhookOutcome {
    if invoice.is_subscription_create() {
        return WebhookOutcome::Ignored("first invoice is fulfilled by checkout");
    }
    let Some(subscription_id) = invoice.subscription_id() else {
        return WebhookOutcome::Ignored("invoice without subscription");
    };

    let user_id = match user_for_customer(state, invoice.customer.as_deref()).await {
        Ok(user_id) => user_id,
        Err(outcome) => return outcome,
    };
    let ledger = match state.ledger.find_ledger(&user_id).await {
        Ok(Some(ledger)) => ledger,
        Ok(None) => return WebhookOutcome::NotFound(format!("no ledger for user {user_id}")),
        Err(err) => return ledger_failure(err),
    };
    let Some(plan) = ledger
        .subscription_plan_id
        .as_deref()
        .and_then(find_plan)
        .filter(|plan| plan.is_subscription())
    else {
        warn!(
            %user_id,
            plan_id = ?ledger.subscription_plan_id,
            "renewal without a known subscription plan"
        );
        return WebhookOutcome::BadRequest("no subscription plan on record".into());
    };

    let terms = SubscriptionTerms {
        plan_id: plan.id.to_string(),
        expires_at: subscription_period_end(state, Some(subscription_id)).await,
        stripe_subscription_id: Some(subscription_id.to_string()),
    };
    grant(state, &user_id, plan, Some(terms)).await
}

async fn revoke(state: &AppState, customer: Option<&str>) -> WebhookOutcome {
    let user_id = match user_for_customer(state, customer).await {
        Ok(user_id) => user_id,
        Err(outcome) => return outcome,
    };
    match state
        .provisioner
        .revoke_subscription(&user_id, SubscriptionStatus::Inactive)
        .await
    {
        Ok(_) => WebhookOutcome::Processed,
        Err(err) => err.into(),
    }
}

async fn payment_failed(state: &AppState, invoice: InvoiceObject) -> WebhookOutcome {
    if invoice.subscription_id().is_none() {
        return WebhookOutcome::Ignored("invoice without subscription");
    }
    revoke(state, invoice.customer.as_deref()).await
}

async fn subscription_deleted(state: &AppState, sub: SubscriptionObject) -> WebhookOutcome {
    revoke(state, sub.customer.as_deref()).await
}

async fn subscription_updated(state: &AppState, sub: SubscriptionObject) -> WebhookOutcome {
    let user_id = match user_for_customer(state, sub.customer.as_deref()).await {
        Ok(user_id) => user_id,
        Err(outcome) => return outcome,
    };
    let current = match state.ledger.find_ledger(&user_id).await {
        Ok(Some(ledger)) => ledger.subscription_status,
        Ok(None) => return WebhookOutcome::NotFound(format!("no ledger for user {user_id}")),
        Err(err) => return ledger_failure(err),
    };

    let (status, expires_at) = if sub.cancel_at_period_end {
        (
            SubscriptionStatus::Canceled,
            to_datetime(sub.cancellation_effective_at()),
        )
    } else {
        match sub.status.as_deref() {
            Some("past_due") => (SubscriptionStatus::PastDue, None),
            Some("active")
                if matches!(
                    current,
                    SubscriptionStatus::Canceled | SubscriptionStatus::PastDue
                ) =>
            {
                (SubscriptionStatus::Active, to_datetime(sub.period_end()))
            }
            _ => return WebhookOutcome::Ignored("no status change"),
        }
    };

    match state
        .provisioner
        .update_subscription_status(&user_id, status, expires_at)
        .await
    {
        Ok(_) => WebhookOutcome::Processed,
        Err(err) => err.into(),
    }
}
