//! Typed view of the Stripe events the webhook acts on.
//!
//! Only the fields the handlers read are modelled; everything else in the
//! payload is ignored by serde.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl CheckoutSessionObject {
    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.metadata_value("user_id")
            .or_else(|| self.metadata_value("firebaseUID"))
            .or_else(|| {
                self.client_reference_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
    }

    pub fn plan_id(&self) -> Option<&str> {
        self.metadata_value("planId")
    }

    /// Session mode wins; the metadata flag is only consulted when mode is absent.
    pub fn is_subscription(&self) -> bool {
        match self.mode.as_deref() {
            Some(mode) => mode == "subscription",
            None => self.metadata_value("isSubscription") == Some("true"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceSubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<String>,
}

impl InvoiceObject {
    /// Newer API versions move the subscription under `parent.subscription_details`.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }

    /// First invoice of a subscription; its credits are granted by checkout completion.
    pub fn is_subscription_create(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl SubscriptionObject {
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end.or_else(|| {
            self.items
                .as_ref()
                .and_then(|items| items.data.iter().filter_map(|i| i.current_period_end).max())
        })
    }

    /// Date the credits stop being usable once cancellation is scheduled.
    pub fn cancellation_effective_at(&self) -> Option<i64> {
        self.cancel_at.or_else(|| self.period_end())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    CheckoutCompleted(CheckoutSessionObject),
    InvoicePaid(InvoiceObject),
    PaymentFailed(InvoiceObject),
    SubscriptionDeleted(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    Unrecognized,
}

impl BillingEvent {
    /// Classifies an event by its declared type. Unknown types never fail.
    pub fn classify(event_type: &str, object: &Value) -> Result<Self, serde_json::Error> {
        let event = match event_type {
            CHECKOUT_SESSION_COMPLETED => {
                BillingEvent::CheckoutCompleted(CheckoutSessionObject::deserialize(object)?)
            }
            INVOICE_PAID => BillingEvent::InvoicePaid(InvoiceObject::deserialize(object)?),
            INVOICE_PAYMENT_FAILED => {
                BillingEvent::PaymentFailed(InvoiceObject::deserialize(object)?)
            }
            SUBSCRIPTION_DELETED => {
                BillingEvent::SubscriptionDeleted(SubscriptionObject::deserialize(object)?)
            }
            SUBSCRIPTION_UPDATED => {
                BillingEvent::SubscriptionUpdated(SubscriptionObject::deserialize(object)?)
            }
            _ => BillingEvent::Unrecognized,
        };
        Ok(event)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BillingEvent::CheckoutCompleted(_) => "checkout_completed",
            BillingEvent::InvoicePaid(_) => "invoice_paid",
            BillingEvent::PaymentFailed(_) => "payment_failed",
            BillingEvent::SubscriptionDeleted(_) => "subscription_deleted",
            BillingEvent::SubscriptionUpdated(_) => "subscription_updated",
            BillingEvent::Unrecognized => "unrecognized",
        }
    }
}
