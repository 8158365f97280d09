use crate::config::Config;
use crate::db::{
    ledger_repository::LedgerRepository, stripe_event_log_repository::StripeEventLogRepository,
};
use crate::services::provisioning::CreditProvisioner;
use crate::services::stripe::StripeService;
use crate::utils::jwt::{JwtKeyProvider, JwtKeys};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerRepository>,
    pub stripe_events: Arc<dyn StripeEventLogRepository>,
    pub stripe: Arc<dyn StripeService>,
    pub provisioner: CreditProvisioner,
    pub config: Arc<Config>,
    pub jwt_keys: Arc<JwtKeys>,
}

impl JwtKeyProvider for AppState {
    fn jwt_keys(&self) -> &JwtKeys {
        &self.jwt_keys
    }

    fn jwt_issuer(&self) -> &str {
        &self.config.jwt_issuer
    }

    fn jwt_audience(&self) -> &str {
        &self.config.jwt_audience
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::config::{OpenRouterSettings, StripeSettings};
    use crate::db::mock_db::MockDb;
    use crate::db::mock_stripe_event_log_repository::MockStripeEventLogRepository;
    use crate::routes::auth::claims::Claims;
    use crate::services::openrouter::InMemoryKeyProvisioner;
    use crate::services::provisioning::KeyReadFailurePolicy;
    use crate::services::stripe::MockStripeService;
    use crate::utils::jwt::create_jwt;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub const TEST_WEBHOOK_SECRET: &str = "whsec_0123456789abcdef";

    /// App state wired to in-memory collaborators, with handles kept for assertions.
    pub struct TestHarness {
        pub state: AppState,
        pub db: Arc<MockDb>,
        pub keys: Arc<InMemoryKeyProvisioner>,
        pub stripe: Arc<MockStripeService>,
        pub events: Arc<MockStripeEventLogRepository>,
    }

    pub fn test_config() -> Config {
        Config {
            database_url: String::new(),
            bind_addr: "127.0.0.1:0".into(),
            allowed_origins: vec!["http://localhost".into()],
            stripe: StripeSettings {
                secret_key: "sk_test_stub".into(),
                webhook_secret: TEST_WEBHOOK_SECRET.into(),
                price_ids: [
                    ("monthly-basic", "price_basic"),
                    ("monthly-pro", "price_pro"),
                    ("credits-1500", "price_1500"),
                    ("credits-6000", "price_6000"),
                ]
                .into_iter()
                .map(|(plan, price)| (plan.to_string(), price.to_string()))
                .collect(),
            },
            openrouter: OpenRouterSettings {
                base_url: "http://localhost".into(),
                provisioning_key: Some("prov-test".into()),
                timeout: Duration::from_secs(1),
            },
            key_read_failure_policy: KeyReadFailurePolicy::Abort,
            starter_credits: 0.1,
            stripe_event_retention: Duration::from_secs(30 * 24 * 60 * 60),
            jwt_issuer: "test-issuer".into(),
            jwt_audience: "test-audience".into(),
        }
    }

    pub fn test_jwt_keys() -> Arc<JwtKeys> {
        Arc::new(
            JwtKeys::from_secret("0123456789abcdef0123456789abcdef")
                .expect("test JWT secret should be valid"),
        )
    }

    pub fn harness(db: MockDb, keys: InMemoryKeyProvisioner) -> TestHarness {
        harness_with_config(db, keys, test_config())
    }

    pub fn harness_with_config(
        db: MockDb,
        keys: InMemoryKeyProvisioner,
        config: Config,
    ) -> TestHarness {
        let db = Arc::new(db);
        let keys = Arc::new(keys);
        let stripe = Arc::new(MockStripeService::new().with_webhook_secret(TEST_WEBHOOK_SECRET));
        let events = Arc::new(MockStripeEventLogRepository::default());
        let provisioner =
            CreditProvisioner::new(db.clone(), keys.clone(), config.key_read_failure_policy);

        let state = AppState {
            ledger: db.clone(),
            stripe_events: events.clone(),
            stripe: stripe.clone(),
            provisioner,
            config: Arc::new(config),
            jwt_keys: test_jwt_keys(),
        };

        TestHarness {
            state,
            db,
            keys,
            stripe,
            events,
        }
    }

    /// A bearer token the auth extractor accepts for `user_id`.
    pub fn bearer_for(state: &AppState, user_id: &str, email: Option<&str>) -> String {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            + 3600;
        let claims = Claims {
            sub: user_id.into(),
            email: email.map(str::to_string),
            exp: exp as usize,
            iss: String::new(),
            aud: String::new(),
        };
        let token = create_jwt(
            claims,
            state.jwt_keys(),
            state.jwt_issuer(),
            state.jwt_audience(),
        )
        .expect("token");
        format!("Bearer {token}")
    }
}
