//! Credit provisioning: keeps a user's key limit and ledger in step.
//!
//! A grant reads the key's current usage and limit, splits what is left into
//! one-time and subscription credits, computes the new limit, patches (or
//! creates) the key and only then writes the ledger. A failed key call leaves
//! the ledger untouched.

use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::db::ledger_repository::LedgerRepository;
use crate::models::ledger::{
    LedgerRecord, LedgerUpdate, ProvisionedKey, SubscriptionPatch, SubscriptionStatus,
};
use crate::models::plan::Plan;
use crate::services::openrouter::{CreateKeyRequest, KeyProvisioner, KeyServiceError, KeySnapshot};
use crate::utils::user_locks::UserLocks;

/// What to do when the current usage of an existing key cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyReadFailurePolicy {
    /// Fail the operation; the caller may retry.
    #[default]
    Abort,
    /// Continue with usage and limit of zero. Remaining credits are lost.
    TreatAsZero,
}

impl FromStr for KeyReadFailurePolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(KeyReadFailurePolicy::Abort),
            "zero" | "treat_as_zero" => Ok(KeyReadFailurePolicy::TreatAsZero),
            other => Err(format!("expected `abort` or `zero`, got `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no ledger for user {0}")]
    NotFound(String),
    #[error("key provisioning is not configured")]
    Config,
    #[error("key service call failed: {0}")]
    Upstream(#[source] KeyServiceError),
    #[error("ledger access failed: {0}")]
    Ledger(#[from] sqlx::Error),
    /// The key already carries `new_limit`; repeating the operation would apply
    /// the grant to the key a second time.
    #[error("key {key_hash} set to {new_limit} but the ledger write failed: {source}")]
    LedgerAfterKeyUpdate {
        key_hash: String,
        new_limit: f64,
        #[source]
        source: sqlx::Error,
    },
}

impl From<KeyServiceError> for ProvisionError {
    fn from(err: KeyServiceError) -> Self {
        match err {
            KeyServiceError::MissingCredential => ProvisionError::Config,
            other => ProvisionError::Upstream(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionTerms {
    pub plan_id: String,
    pub expires_at: Option<OffsetDateTime>,
    pub stripe_subscription_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GrantKind {
    OneTime,
    /// Replaces the previous period's allotment instead of adding to it.
    Subscription(SubscriptionTerms),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreditGrant {
    pub native_credits: f64,
    pub display_credits: f64,
    pub kind: GrantKind,
}

impl CreditGrant {
    pub fn one_time(native_credits: f64, display_credits: f64) -> Self {
        Self {
            native_credits,
            display_credits,
            kind: GrantKind::OneTime,
        }
    }

    pub fn for_plan(plan: &Plan, terms: Option<SubscriptionTerms>) -> Self {
        let kind = match terms {
            Some(terms) => GrantKind::Subscription(terms),
            None => GrantKind::OneTime,
        };
        Self {
            native_credits: plan.native_credits,
            display_credits: plan.display_credits,
            kind,
        }
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self.kind, GrantKind::Subscription(_))
    }
}

/// Split of a key's remaining balance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    pub usage: f64,
    pub remaining_one_time: f64,
    pub remaining_subscription: f64,
}

/// Attributes the remaining balance to the held subscription allotment first;
/// whatever exceeds it is one-time credit.
pub fn reconcile(snapshot: KeySnapshot, held_subscription_credits: f64) -> Reconciliation {
    let total_remaining = snapshot.remaining();
    let remaining_one_time = if held_subscription_credits > 0.0 {
        (total_remaining - held_subscription_credits).max(0.0)
    } else {
        total_remaining
    };
    Reconciliation {
        usage: snapshot.usage.max(0.0),
        remaining_one_time,
        remaining_subscription: total_remaining - remaining_one_time,
    }
}

pub fn compute_new_limit(rec: &Reconciliation, grant: &CreditGrant) -> f64 {
    match grant.kind {
        // The old allotment is dropped, not carried over.
        GrantKind::Subscription(_) => rec.usage + rec.remaining_one_time + grant.native_credits,
        GrantKind::OneTime => {
            rec.usage + rec.remaining_one_time + rec.remaining_subscription + grant.native_credits
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOutcome {
    pub key_hash: String,
    pub new_limit: f64,
    pub key_created: bool,
    pub ledger: LedgerRecord,
}

#[derive(Clone)]
pub struct CreditProvisioner {
    ledger: Arc<dyn LedgerRepository>,
    keys: Arc<dyn KeyProvisioner>,
    policy: KeyReadFailurePolicy,
    locks: UserLocks,
}

impl CreditProvisioner {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        keys: Arc<dyn KeyProvisioner>,
        policy: KeyReadFailurePolicy,
    ) -> Self {
        Self {
            ledger,
            keys,
            policy,
            locks: UserLocks::new(),
        }
    }

    pub fn locks(&self) -> &UserLocks {
        &self.locks
    }

    async fn load(&self, user_id: &str) -> Result<LedgerRecord, ProvisionError> {
        self.ledger
            .find_ledger(user_id)
            .await?
            .ok_or_else(|| ProvisionError::NotFound(user_id.to_string()))
    }

    async fn read_key(&self, hash: &str) -> Result<KeySnapshot, ProvisionError> {
        match self.keys.get_key(hash).await {
            Ok(snapshot) => Ok(snapshot),
            Err(KeyServiceError::MissingCredential) => Err(ProvisionError::Config),
            Err(err) => {
                if err.is_not_found() {
                    // Keys are never recreated here; the ledger keeps pointing at the hash.
                    error!(key_hash = %hash, "provisioned key no longer exists at the key service");
                }
                match self.policy {
                    KeyReadFailurePolicy::Abort => Err(ProvisionError::Upstream(err)),
                    KeyReadFailurePolicy::TreatAsZero => {
                        warn!(?err, key_hash = %hash, "key read failed; treating as zero");
                        Ok(KeySnapshot::default())
                    }
                }
            }
        }
    }

    /// Adds a grant to the user's key, creating the key on first purchase.
    pub async fn provision(
        &self,
        user_id: &str,
        grant: CreditGrant,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let _guard = self.locks.lock(user_id).await;
        let record = self.load(user_id).await?;
        self.grant_locked(user_id, record, grant).await
    }

    /// Grants credits only to users that have no key yet. Returns `None` when
    /// a key already exists.
    pub async fn provision_if_keyless(
        &self,
        user_id: &str,
        grant: CreditGrant,
    ) -> Result<Option<ProvisionOutcome>, ProvisionError> {
        let _guard = self.locks.lock(user_id).await;
        let record = self.load(user_id).await?;
        if record.provisioned_key().is_some() {
            return Ok(None);
        }
        self.grant_locked(user_id, record, grant).await.map(Some)
    }

    async fn grant_locked(
        &self,
        user_id: &str,
        record: LedgerRecord,
        grant: CreditGrant,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let held = record.held_subscription_credits();

        let existing = record.provisioned_key();
        let rec = match &existing {
            Some(key) => reconcile(self.read_key(&key.hash).await?, held),
            None => Reconciliation {
                usage: 0.0,
                remaining_one_time: record.one_time_credits.max(0.0),
                remaining_subscription: held,
            },
        };
        let new_limit = compute_new_limit(&rec, &grant);

        let (key_hash, new_key) = match existing {
            Some(key) => {
                self.keys.update_key_limit(&key.hash, new_limit).await?;
                (key.hash, None)
            }
            None => {
                let issued = self
                    .keys
                    .create_key(CreateKeyRequest::for_customer(user_id, new_limit))
                    .await?;
                let key = ProvisionedKey {
                    hash: issued.hash.clone(),
                    secret: issued.key,
                };
                (issued.hash, Some(key))
            }
        };
        let key_created = new_key.is_some();

        let update = match &grant.kind {
            GrantKind::OneTime => LedgerUpdate {
                provisioned_key: new_key,
                one_time_credits_added: grant.native_credits,
                display_credits_added: grant.display_credits,
                subscription: SubscriptionPatch::default(),
            },
            GrantKind::Subscription(terms) => LedgerUpdate {
                provisioned_key: new_key,
                subscription: SubscriptionPatch {
                    status: Some(SubscriptionStatus::Active),
                    plan_id: Some(terms.plan_id.clone()),
                    credits: Some(grant.native_credits),
                    display_credits: Some(grant.display_credits),
                    expires_at: terms.expires_at,
                    stripe_subscription_id: terms.stripe_subscription_id.clone(),
                },
                ..Default::default()
            },
        };

        let ledger = match self.ledger.apply_update(user_id, &update).await {
            Ok(ledger) => ledger,
            Err(err) => {
                error!(
                    ?err,
                    %user_id,
                    %key_hash,
                    new_limit,
                    "ledger write failed after key update"
                );
                return Err(ProvisionError::LedgerAfterKeyUpdate {
                    key_hash,
                    new_limit,
                    source: err,
                });
            }
        };

        info!(
            %user_id,
            %key_hash,
            new_limit,
            usage = rec.usage,
            remaining_one_time = rec.remaining_one_time,
            subscription = grant.is_subscription(),
            key_created,
            "credits provisioned"
        );

        Ok(ProvisionOutcome {
            key_hash,
            new_limit,
            key_created,
            ledger,
        })
    }

    /// Strips the held subscription allotment from the key and marks the
    /// subscription with `status`. Returns the new limit when a key exists.
    pub async fn revoke_subscription(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
    ) -> Result<Option<f64>, ProvisionError> {
        let _guard = self.locks.lock(user_id).await;
        let record = self.load(user_id).await?;
        let held = record.held_subscription_credits();

        let patched = match record.provisioned_key() {
            Some(key) => {
                let rec = reconcile(self.read_key(&key.hash).await?, held);
                let new_limit = rec.usage + rec.remaining_one_time;
                self.keys.update_key_limit(&key.hash, new_limit).await?;
                Some((key.hash, new_limit))
            }
            None => None,
        };
        let new_limit = patched.as_ref().map(|(_, limit)| *limit);

        let update = LedgerUpdate {
            subscription: SubscriptionPatch {
                status: Some(status),
                credits: Some(0.0),
                display_credits: Some(0.0),
                ..Default::default()
            },
            ..Default::default()
        };
        if let Err(err) = self.ledger.apply_update(user_id, &update).await {
            return Err(match patched {
                Some((key_hash, new_limit)) => {
                    error!(
                        ?err,
                        %user_id,
                        %key_hash,
                        new_limit,
                        "ledger write failed after revocation"
                    );
                    ProvisionError::LedgerAfterKeyUpdate {
                        key_hash,
                        new_limit,
                        source: err,
                    }
                }
                None => err.into(),
            });
        }

        info!(
            %user_id,
            revoked = held,
            ?new_limit,
            status = %status,
            "subscription credits revoked"
        );
        Ok(new_limit)
    }

    /// Changes only the subscription status (and expiry); the key is untouched.
    pub async fn update_subscription_status(
        &self,
        user_id: &str,
        status: SubscriptionStatus,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<LedgerRecord, ProvisionError> {
        let _guard = self.locks.lock(user_id).await;
        self.load(user_id).await?;
        let update = LedgerUpdate {
            subscription: SubscriptionPatch {
                status: Some(status),
                expires_at,
                ..Default::default()
            },
            ..Default::default()
        };
        let ledger = self.ledger.apply_update(user_id, &update).await?;
        info!(%user_id, status = %status, "subscription status updated");
        Ok(ledger)
    }
}
