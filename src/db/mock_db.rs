use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::db::ledger_repository::{CustomerLink, LedgerRepository};
use crate::models::ledger::{LedgerRecord, LedgerUpdate};

/// In-memory ledger store with the same write semantics as the Postgres one.
#[derive(Default)]
pub struct MockDb {
    pub ledgers: Mutex<HashMap<String, LedgerRecord>>,
    /// When set, every write fails with a pool error.
    pub should_fail: Mutex<bool>,
    pub update_calls: Mutex<usize>,
}

impl MockDb {
    pub fn with_ledger(self, record: LedgerRecord) -> Self {
        self.ledgers
            .lock()
            .unwrap()
            .insert(record.user_id.clone(), record);
        self
    }

    pub fn ledger(&self, user_id: &str) -> Option<LedgerRecord> {
        self.ledgers.lock().unwrap().get(user_id).cloned()
    }

    pub fn fail_writes(&self) {
        *self.should_fail.lock().unwrap() = true;
    }

    fn check_failure(&self) -> Result<(), sqlx::Error> {
        if *self.should_fail.lock().unwrap() {
            Err(sqlx::Error::PoolTimedOut)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerRepository for MockDb {
    async fn ensure_ledger(
        &self,
        user_id: &str,
        email: Option<&str>,
    ) -> Result<LedgerRecord, sqlx::Error> {
        self.check_failure()?;
        let mut ledgers = self.ledgers.lock().unwrap();
        let record = ledgers
            .entry(user_id.to_string())
            .or_insert_with(|| LedgerRecord::new(user_id, None));
        if record.email.is_none() {
            record.email = email.map(str::to_string);
        }
        Ok(record.clone())
    }

    async fn find_ledger(&self, user_id: &str) -> Result<Option<LedgerRecord>, sqlx::Error> {
        Ok(self.ledger(user_id))
    }

    async fn find_user_id_by_stripe_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        Ok(self
            .ledgers
            .lock()
            .unwrap()
            .values()
            .find(|r| r.stripe_customer_id.as_deref() == Some(customer_id))
            .map(|r| r.user_id.clone()))
    }

    async fn set_stripe_customer_id(
        &self,
        user_id: &str,
        customer_id: &str,
    ) -> Result<CustomerLink, sqlx::Error> {
        self.check_failure()?;
        let mut ledgers = self.ledgers.lock().unwrap();
        let taken = ledgers.values().any(|r| {
            r.user_id != user_id && r.stripe_customer_id.as_deref() == Some(customer_id)
        });
        if let Some(record) = ledgers.get_mut(user_id) {
            if record.stripe_customer_id.is_none() {
                if taken {
                    return Ok(CustomerLink::TakenByOtherUser);
                }
                record.stripe_customer_id = Some(customer_id.to_string());
            }
        }
        Ok(CustomerLink::Linked)
    }

    async fn apply_update(
        &self,
        user_id: &str,
        update: &LedgerUpdate,
    ) -> Result<LedgerRecord, sqlx::Error> {
        *self.update_calls.lock().unwrap() += 1;
        self.check_failure()?;
        let mut ledgers = self.ledgers.lock().unwrap();
        let record = ledgers.get_mut(user_id).ok_or(sqlx::Error::RowNotFound)?;
        record.apply(update);
        Ok(record.clone())
    }
}
