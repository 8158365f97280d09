use std::collections::BTreeMap;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::db::ledger_repository::CustomerLink;
use crate::models::ledger::LedgerRecord;
use crate::models::plan::find_plan;
use crate::responses::JsonResponse;
use crate::routes::auth::session::AuthUser;
use crate::services::provisioning::{CreditGrant, ProvisionError};
use crate::services::stripe::{CheckoutLineItem, CheckoutMode, CreateCheckoutSessionRequest};
use crate::state::AppState;

/// Display credits shown per native credit for the starter grant.
const STARTER_DISPLAY_MULTIPLIER: f64 = 1000.0;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutPayload {
    pub plan_id: Option<String>,
    pub is_subscription: Option<bool>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalPayload {
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub status: String,
    pub plan_id: Option<String>,
    pub credits: f64,
    /// Unix seconds.
    pub expires_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserDataResponse {
    pub user_id: String,
    pub email: Option<String>,
    pub credits: f64,
    pub one_time_credits: f64,
    pub has_key: bool,
    pub subscription: SubscriptionSummary,
}

impl From<&LedgerRecord> for UserDataResponse {
    fn from(record: &LedgerRecord) -> Self {
        UserDataResponse {
            user_id: record.user_id.clone(),
            email: record.email.clone(),
            credits: record.total_display_credits(),
            one_time_credits: record.display_credits,
            has_key: record.provisioned_key().is_some(),
            subscription: SubscriptionSummary {
                status: record.subscription_status.to_string(),
                plan_id: record.subscription_plan_id.clone(),
                credits: if record.subscription_status.holds_credits() {
                    record.subscription_display_credits
                } else {
                    0.0
                },
                expires_at: record.subscription_expires_at.map(|t| t.unix_timestamp()),
            },
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, Response> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| JsonResponse::bad_request(&format!("{name} is required")).into_response())
}

/// Loads the caller's ledger, creating an empty one on first contact.
async fn ensure_ledger(state: &AppState, user: &AuthUser) -> Result<LedgerRecord, Response> {
    state
        .ledger
        .ensure_ledger(&user.user_id, user.email.as_deref())
        .await
        .map_err(|err| {
            error!(?err, user_id = %user.user_id, "failed to load ledger");
            JsonResponse::server_error("Failed to load account").into_response()
        })
}

/// Returns the ledger's Stripe customer, creating and storing one if needed.
async fn ensure_customer(
    state: &AppState,
    user: &AuthUser,
    ledger: &LedgerRecord,
) -> Result<String, Response> {
    if let Some(id) = &ledger.stripe_customer_id {
        return Ok(id.clone());
    }

    let created = state
        .stripe
        .create_customer(ledger.email.as_deref(), &user.user_id)
        .await
        .map_err(|err| {
            error!(?err, user_id = %user.user_id, "failed to create stripe customer");
            JsonResponse::server_error("Failed to create customer").into_response()
        })?;

    let stored = async {
        let link = state
            .ledger
            .set_stripe_customer_id(&user.user_id, &created)
            .await?;
        Ok::<_, sqlx::Error>((link, state.ledger.find_ledger(&user.user_id).await?))
    }
    .await;
    let stored = match stored {
        Ok((CustomerLink::Linked, stored)) => stored,
        Ok((CustomerLink::TakenByOtherUser, _)) => {
            error!(
                user_id = %user.user_id,
                customer = %created,
                "new stripe customer already linked to another user"
            );
            return Err(JsonResponse::server_error("Failed to store customer").into_response());
        }
        Err(err) => {
            error!(?err, user_id = %user.user_id, "failed to store stripe customer");
            return Err(JsonResponse::server_error("Failed to store customer").into_response());
        }
    };

    // A concurrent request may have stored its customer first.
    Ok(stored
        .and_then(|record| record.stripe_customer_id)
        .unwrap_or(created))
}

// POST /api/billing/checkout
pub async fn create_checkout_session(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CheckoutPayload>,
) -> Response {
    let plan_id = match required(&payload.plan_id, "planId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(is_subscription) = payload.is_subscription else {
        return JsonResponse::bad_request("isSubscription is required").into_response();
    };
    let success_url = match required(&payload.success_url, "successUrl") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cancel_url = match required(&payload.cancel_url, "cancelUrl") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Some(plan) = find_plan(plan_id) else {
        return JsonResponse::bad_request(&format!("Unknown plan: {plan_id}")).into_response();
    };
    if plan.is_subscription() != is_subscription {
        return JsonResponse::bad_request(&format!(
            "Plan {plan_id} is not a {} plan",
            if is_subscription { "subscription" } else { "one-time" }
        ))
        .into_response();
    }
    let Some(price_id) = state.config.stripe.price_id(plan.id) else {
        warn!(plan_id = plan.id, env = %plan.price_env_var(), "no stripe price configured");
        return JsonResponse::bad_request(&format!("Plan {plan_id} is not available"))
            .into_response();
    };

    let ledger = match ensure_ledger(&state, &user).await {
        Ok(ledger) => ledger,
        Err(resp) => return resp,
    };
    let customer_id = match ensure_customer(&state, &user, &ledger).await {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let mut metadata = BTreeMap::new();
    metadata.insert("user_id".to_string(), user.user_id.clone());
    metadata.insert("planId".to_string(), plan.id.to_string());
    metadata.insert("isSubscription".to_string(), is_subscription.to_string());

    let req = CreateCheckoutSessionRequest {
        success_url: success_url.to_string(),
        cancel_url: cancel_url.to_string(),
        mode: if is_subscription {
            CheckoutMode::Subscription
        } else {
            CheckoutMode::Payment
        },
        line_items: vec![CheckoutLineItem {
            price: price_id.to_string(),
            quantity: 1,
        }],
        client_reference_id: Some(user.user_id.clone()),
        customer: Some(customer_id),
        metadata: Some(metadata),
    };

    match state.stripe.create_checkout_session(req).await {
        Ok(session) => match session.url {
            Some(url) => {
                info!(
                    user_id = %user.user_id,
                    plan_id = plan.id,
                    session_id = %session.id,
                    "checkout session created"
                );
                (StatusCode::OK, Json(json!({ "url": url }))).into_response()
            }
            None => {
                error!(session_id = %session.id, "checkout session has no url");
                JsonResponse::server_error("Failed to create checkout session").into_response()
            }
        },
        Err(err) => {
            error!(?err, user_id = %user.user_id, "failed to create checkout session");
            JsonResponse::server_error("Failed to create checkout session").into_response()
        }
    }
}

// GET /api/billing/key
pub async fn get_user_key(State(state): State<AppState>, user: AuthUser) -> Response {
    let ledger = match ensure_ledger(&state, &user).await {
        Ok(ledger) => ledger,
        Err(resp) => return resp,
    };
    match ledger.provisioned_key() {
        Some(key) => (
            StatusCode::OK,
            Json(json!({
                "apiKey": key.secret,
                "credits": ledger.total_display_credits(),
            })),
        )
            .into_response(),
        None => JsonResponse::not_found("No API key has been provisioned yet").into_response(),
    }
}

// POST /api/billing/portal
pub async fn create_customer_portal(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<PortalPayload>,
) -> Response {
    let return_url = match required(&payload.return_url, "returnUrl") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ledger = match ensure_ledger(&state, &user).await {
        Ok(ledger) => ledger,
        Err(resp) => return resp,
    };
    let Some(customer_id) = ledger.stripe_customer_id.as_deref() else {
        return JsonResponse::failed_precondition("No billing account exists for this user")
            .into_response();
    };

    match state
        .stripe
        .create_billing_portal_session(customer_id, return_url)
        .await
    {
        Ok(url) => (StatusCode::OK, Json(json!({ "url": url }))).into_response(),
        Err(err) => {
            error!(?err, user_id = %user.user_id, "failed to create billing portal session");
            JsonResponse::server_error("Failed to create portal session").into_response()
        }
    }
}

// GET /api/billing/me
pub async fn get_user_data(State(state): State<AppState>, user: AuthUser) -> Response {
    match ensure_ledger(&state, &user).await {
        Ok(ledger) => (StatusCode::OK, Json(UserDataResponse::from(&ledger))).into_response(),
        Err(resp) => resp,
    }
}

// POST /api/billing/bootstrap
pub async fn bootstrap_user(State(state): State<AppState>, user: AuthUser) -> Response {
    let ledger = match ensure_ledger(&state, &user).await {
        Ok(ledger) => ledger,
        Err(resp) => return resp,
    };

    let starter = state.config.starter_credits;
    if starter <= 0.0 || ledger.provisioned_key().is_some() {
        return (StatusCode::OK, Json(UserDataResponse::from(&ledger))).into_response();
    }

    let grant = CreditGrant::one_time(starter, starter * STARTER_DISPLAY_MULTIPLIER);
    match state
        .provisioner
        .provision_if_keyless(&user.user_id, grant)
        .await
    {
        Ok(Some(outcome)) => {
            info!(
                user_id = %user.user_id,
                starter,
                key_hash = %outcome.key_hash,
                "starter credits granted"
            );
            (StatusCode::OK, Json(UserDataResponse::from(&outcome.ledger))).into_response()
        }
        Ok(None) => get_user_data(State(state), user).await,
        Err(ProvisionError::Config) => {
            error!(user_id = %user.user_id, "key provisioning is not configured");
            JsonResponse::server_error("Key provisioning is not configured").into_response()
        }
        Err(err) => {
            error!(?err, user_id = %user.user_id, "failed to grant starter credits");
            JsonResponse::server_error("Failed to provision starter credits").into_response()
        }
    }
}
