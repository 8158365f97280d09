use async_trait::async_trait;

use crate::models::ledger::{LedgerRecord, LedgerUpdate};

/// Result of linking a gateway customer to a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerLink {
    /// Stored, or a customer was already recorded for this user.
    Linked,
    /// Another ledger already holds this customer id.
    TakenByOtherUser,
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Creates the ledger with zero balances if it does not exist yet. A known
    /// email is never overwritten.
    async fn ensure_ledger(
        &self,
        user_id: &str,
        email: Option<&str>,
    ) -> Result<LedgerRecord, sqlx::Error>;

    async fn find_ledger(&self, user_id: &str) -> Result<Option<LedgerRecord>, sqlx::Error>;

    async fn find_user_id_by_stripe_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<String>, sqlx::Error>;

    /// Stores the gateway customer id unless one is already recorded.
    async fn set_stripe_customer_id(
        &self,
        user_id: &str,
        customer_id: &str,
    ) -> Result<CustomerLink, sqlx::Error>;

    /// Applies every change of one provisioning step in a single write.
    /// Fails with `RowNotFound` when the ledger does not exist.
    async fn apply_update(
        &self,
        user_id: &str,
        update: &LedgerUpdate,
    ) -> Result<LedgerRecord, sqlx::Error>;
}
