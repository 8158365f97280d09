use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Active,
    /// Cancels at period end; credits stay usable until `subscription_expires_at`.
    Canceled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }

    /// Whether the subscription allotment is still part of the key limit.
    pub fn holds_credits(self) -> bool {
        !matches!(self, SubscriptionStatus::Inactive)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown subscription status: {0}")]
pub struct UnknownSubscriptionStatus(pub String);

impl FromStr for SubscriptionStatus {
    type Err = UnknownSubscriptionStatus;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "active" => Ok(SubscriptionStatus::Active),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            other => Err(UnknownSubscriptionStatus(other.to_string())),
        }
    }
}

/// Reference and secret of a key issued by the key-provisioning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedKey {
    pub hash: String,
    pub secret: String,
}

/// Per-user credit ledger. Credit amounts are in the key service's native unit
/// unless the field name says `display`.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRecord {
    pub user_id: String,
    pub email: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub provisioned_key_hash: Option<String>,
    pub provisioned_key_secret: Option<String>,
    pub one_time_credits: f64,
    pub display_credits: f64,
    pub subscription_status: SubscriptionStatus,
    pub subscription_plan_id: Option<String>,
    pub subscription_credits: f64,
    pub subscription_display_credits: f64,
    pub subscription_expires_at: Option<OffsetDateTime>,
    pub stripe_subscription_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl LedgerRecord {
    pub fn new(user_id: impl Into<String>, email: Option<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            user_id: user_id.into(),
            email,
            stripe_customer_id: None,
            provisioned_key_hash: None,
            provisioned_key_secret: None,
            one_time_credits: 0.0,
            display_credits: 0.0,
            subscription_status: SubscriptionStatus::Inactive,
            subscription_plan_id: None,
            subscription_credits: 0.0,
            subscription_display_credits: 0.0,
            subscription_expires_at: None,
            stripe_subscription_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn provisioned_key(&self) -> Option<ProvisionedKey> {
        match (&self.provisioned_key_hash, &self.provisioned_key_secret) {
            (Some(hash), Some(secret)) => Some(ProvisionedKey {
                hash: hash.clone(),
                secret: secret.clone(),
            }),
            _ => None,
        }
    }

    /// Subscription credits that are currently part of the key limit.
    pub fn held_subscription_credits(&self) -> f64 {
        if self.subscription_status.holds_credits() {
            self.subscription_credits.max(0.0)
        } else {
            0.0
        }
    }

    /// User-facing balance: one-time display credits plus the held subscription allotment.
    pub fn total_display_credits(&self) -> f64 {
        let subscription = if self.subscription_status.holds_credits() {
            self.subscription_display_credits
        } else {
            0.0
        };
        self.display_credits + subscription
    }

    /// Applies an update with the same semantics as the Postgres repository.
    pub fn apply(&mut self, update: &LedgerUpdate) {
        if self.provisioned_key_hash.is_none() {
            if let Some(key) = &update.provisioned_key {
                self.provisioned_key_hash = Some(key.hash.clone());
                self.provisioned_key_secret = Some(key.secret.clone());
            }
        }
        self.one_time_credits += update.one_time_credits_added;
        self.display_credits += update.display_credits_added;

        let patch = &update.subscription;
        if let Some(status) = patch.status {
            self.subscription_status = status;
        }
        if let Some(plan_id) = &patch.plan_id {
            self.subscription_plan_id = Some(plan_id.clone());
        }
        if let Some(credits) = patch.credits {
            self.subscription_credits = credits;
        }
        if let Some(display) = patch.display_credits {
            self.subscription_display_credits = display;
        }
        if let Some(expires_at) = patch.expires_at {
            self.subscription_expires_at = Some(expires_at);
        }
        if let Some(id) = &patch.stripe_subscription_id {
            self.stripe_subscription_id = Some(id.clone());
        }
        self.updated_at = OffsetDateTime::now_utc();
    }
}

/// Replacement values for the subscription columns; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<String>,
    pub credits: Option<f64>,
    pub display_credits: Option<f64>,
    pub expires_at: Option<OffsetDateTime>,
    pub stripe_subscription_id: Option<String>,
}

/// Every ledger change produced by one operation, written in a single statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerUpdate {
    /// Ignored when the record already references a key.
    pub provisioned_key: Option<ProvisionedKey>,
    pub one_time_credits_added: f64,
    pub display_credits_added: f64,
    pub subscription: SubscriptionPatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SubscriptionStatus::Inactive,
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::PastDue,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
        assert_eq!(
            "Cancelled".parse::<SubscriptionStatus>(),
            Ok(SubscriptionStatus::Canceled)
        );
        assert!("trialing".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn inactive_subscription_holds_no_credits() {
        let mut record = LedgerRecord::new("user-1", None);
        record.subscription_credits = 300.0;
        assert_eq!(record.held_subscription_credits(), 0.0);

        record.subscription_status = SubscriptionStatus::Canceled;
        assert_eq!(record.held_subscription_credits(), 300.0);
    }

    #[test]
    fn apply_never_replaces_an_existing_key() {
        let mut record = LedgerRecord::new("user-1", None);
        record.apply(&LedgerUpdate {
            provisioned_key: Some(ProvisionedKey {
                hash: "hash-1".into(),
                secret: "secret-1".into(),
            }),
            one_time_credits_added: 450.0,
            display_credits_added: 1500.0,
            ..Default::default()
        });
        record.apply(&LedgerUpdate {
            provisioned_key: Some(ProvisionedKey {
                hash: "hash-2".into(),
                secret: "secret-2".into(),
            }),
            one_time_credits_added: 450.0,
            ..Default::default()
        });

        assert_eq!(record.provisioned_key_hash.as_deref(), Some("hash-1"));
        assert_eq!(record.provisioned_key_secret.as_deref(), Some("secret-1"));
        assert_eq!(record.one_time_credits, 900.0);
        assert_eq!(record.display_credits, 1500.0);
    }

    #[test]
    fn subscription_patch_replaces_only_given_columns() {
        let mut record = LedgerRecord::new("user-1", None);
        record.subscription_plan_id = Some("monthly-basic".into());
        record.subscription_credits = 300.0;

        record.apply(&LedgerUpdate {
            subscription: SubscriptionPatch {
                status: Some(SubscriptionStatus::Inactive),
                credits: Some(0.0),
                ..Default::default()
            },
            ..Default::default()
        });

        assert_eq!(record.subscription_status, SubscriptionStatus::Inactive);
        assert_eq!(record.subscription_credits, 0.0);
        assert_eq!(record.subscription_plan_id.as_deref(), Some("monthly-basic"));
    }
}
