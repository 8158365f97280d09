use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::db::ledger_repository::{CustomerLink, LedgerRepository};
use crate::models::ledger::{LedgerRecord, LedgerUpdate, SubscriptionStatus};

const LEDGER_COLUMNS: &str = r#"
    user_id, email, stripe_customer_id, provisioned_key_hash, provisioned_key_secret,
    one_time_credits, display_credits, subscription_status, subscription_plan_id,
    subscription_credits, subscription_display_credits, subscription_expires_at,
    stripe_subscription_id, created_at, updated_at
"#;

pub struct PostgresLedgerRepository {
    pub pool: PgPool,
}

fn map_ledger(row: &PgRow) -> Result<LedgerRecord, sqlx::Error> {
    let status: String = row.try_get("subscription_status")?;
    let subscription_status = status
        .parse::<SubscriptionStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(LedgerRecord {
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        stripe_customer_id: row.try_get("stripe_customer_id")?,
        provisioned_key_hash: row.try_get("provisioned_key_hash")?,
        provisioned_key_secret: row.try_get("provisioned_key_secret")?,
        one_time_credits: row.try_get("one_time_credits")?,
        display_credits: row.try_get("display_credits")?,
        subscription_status,
        subscription_plan_id: row.try_get("subscription_plan_id")?,
        subscription_credits: row.try_get("subscription_credits")?,
        subscription_display_credits: row.try_get("subscription_display_credits")?,
        subscription_expires_at: row.try_get("subscription_expires_at")?,
        stripe_subscription_id: row.try_get("stripe_subscription_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LedgerRepository for PostgresLedgerRepository {
    async fn ensure_ledger(
        &self,
        user_id: &str,
        email: Option<&str>,
    ) -> Result<LedgerRecord, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO user_ledgers (user_id, email)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
                SET email = COALESCE(user_ledgers.email, EXCLUDED.email)
            RETURNING {LEDGER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(email)
            .fetch_one(&self.pool)
            .await?;
        map_ledger(&row)
    }

    async fn find_ledger(&self, user_id: &str) -> Result<Option<LedgerRecord>, sqlx::Error> {
        let sql = format!("SELECT {LEDGER_COLUMNS} FROM user_ledgers WHERE user_id = $1");
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_ledger).transpose()
    }

    async fn find_user_id_by_stripe_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM user_ledgers WHERE stripe_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn set_stripe_customer_id(
        &self,
        user_id: &str,
        customer_id: &str,
    ) -> Result<CustomerLink, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE user_ledgers
            SET stripe_customer_id = COALESCE(stripe_customer_id, $2),
                updated_at = now()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(CustomerLink::Linked),
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|db_err| db_err.is_unique_violation()) =>
            {
                Ok(CustomerLink::TakenByOtherUser)
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_update(
        &self,
        user_id: &str,
        update: &LedgerUpdate,
    ) -> Result<LedgerRecord, sqlx::Error> {
        // Right-hand sides see the pre-update row, so the key pair is only
        // written when no key was recorded before.
        let sql = format!(
            r#"
            UPDATE user_ledgers
            SET provisioned_key_hash = COALESCE(provisioned_key_hash, $2),
                provisioned_key_secret = CASE
                    WHEN provisioned_key_hash IS NULL THEN $3
                    ELSE provisioned_key_secret
                END,
                one_time_credits = one_time_credits + $4,
                display_credits = display_credits + $5,
                subscription_status = COALESCE($6, subscription_status),
                subscription_plan_id = COALESCE($7, subscription_plan_id),
                subscription_credits = COALESCE($8, subscription_credits),
                subscription_display_credits = COALESCE($9, subscription_display_credits),
                subscription_expires_at = COALESCE($10, subscription_expires_at),
                stripe_subscription_id = COALESCE($11, stripe_subscription_id),
                updated_at = now()
            WHERE user_id = $1
            RETURNING {LEDGER_COLUMNS}
            "#
        );
        let key = update.provisioned_key.as_ref();
        let patch = &update.subscription;
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(key.map(|k| k.hash.as_str()))
            .bind(key.map(|k| k.secret.as_str()))
            .bind(update.one_time_credits_added)
            .bind(update.display_credits_added)
            .bind(patch.status.map(|s| s.as_str()))
            .bind(patch.plan_id.as_deref())
            .bind(patch.credits)
            .bind(patch.display_credits)
            .bind(patch.expires_at)
            .bind(patch.stripe_subscription_id.as_deref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        map_ledger(&row)
    }
}
