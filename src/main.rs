use std::{net::SocketAddr, sync::Arc};

use agentic_billing_backend::{
    config::Config,
    db::{
        ledger_repository::LedgerRepository,
        postgres_ledger_repository::PostgresLedgerRepository,
        postgres_stripe_event_log_repository::PostgresStripeEventLogRepository,
        stripe_event_log_repository::StripeEventLogRepository,
    },
    responses::JsonResponse,
    routes::{billing_routes, stripe_routes},
    services::{
        openrouter::{KeyProvisioner, OpenRouterClient},
        provisioning::CreditProvisioner,
        stripe::{LiveStripeService, StripeService},
    },
    state::AppState,
    utils::jwt::JwtKeys,
    worker,
};
use anyhow::Context;
use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(feature = "tls")]
use axum_server::tls_rustls::RustlsConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _sentry = init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let jwt_keys = JwtKeys::from_env().context("invalid JWT_SECRET")?;

    let rate_limit_ms: u64 = std::env::var("RATE_LIMITER_MILLISECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(500);
    let rate_limit_burst: u32 = std::env::var("RATE_LIMITER_BURST")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(10);
    let billing_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond(rate_limit_ms)
            .burst_size(rate_limit_burst)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                )
                .into_response()
            })
            .finish()
            .context("invalid rate limiter settings")?,
    );

    let governor_limiter = billing_governor_conf.limiter().clone();
    std::thread::spawn(move || {
        let interval = std::time::Duration::from_secs(60);
        loop {
            std::thread::sleep(interval);
            governor_limiter.retain_recent();
        }
    });

    let pg_pool = establish_connection(&config.database_url).await?;
    sqlx::migrate!("./migrations")
        .run(&pg_pool)
        .await
        .context("failed to run migrations")?;

    let ledger = Arc::new(PostgresLedgerRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn LedgerRepository>;
    let stripe_events = Arc::new(PostgresStripeEventLogRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn StripeEventLogRepository>;
    let stripe =
        Arc::new(LiveStripeService::from_settings(&config.stripe)) as Arc<dyn StripeService>;

    if config.openrouter.provisioning_key.is_none() {
        warn!("OPENROUTER_PROVISIONING_KEY is not set; credit provisioning will fail");
    }
    let keys = Arc::new(
        OpenRouterClient::from_settings(&config.openrouter)
            .context("failed to build key service client")?,
    ) as Arc<dyn KeyProvisioner>;
    let provisioner = CreditProvisioner::new(ledger.clone(), keys, config.key_read_failure_policy);

    let cors = build_cors(&config.allowed_origins);
    let bind_addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid BIND_ADDR {}", config.bind_addr))?;

    let state = AppState {
        ledger,
        stripe_events,
        stripe,
        provisioner,
        config: Arc::new(config),
        jwt_keys: Arc::new(jwt_keys),
    };
    let state_for_worker = state.clone();

    let app = Router::new()
        .route("/", get(root))
        .nest(
            "/api/billing",
            billing_routes().layer(GovernorLayer {
                config: billing_governor_conf,
            }),
        )
        .nest("/api/stripe", stripe_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    worker::start_background_workers(state_for_worker).await;

    // Only compiled with `--features tls`; the plain listener below is then unreachable.
    #[cfg(feature = "tls")]
    {
        let cert = std::env::var("TLS_CERT_LOCATION").context("TLS_CERT_LOCATION is not set")?;
        let key = std::env::var("TLS_KEY_LOCATION").context("TLS_KEY_LOCATION is not set")?;
        let tls_config = RustlsConfig::from_pem_file(cert, key)
            .await
            .context("failed to load TLS certs")?;

        info!(%bind_addr, "listening with TLS");
        axum_server::bind_rustls(bind_addr, tls_config)
            .serve(make_service)
            .await?;
        return Ok(());
    }

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(%bind_addr, "listening without TLS");
    axum::serve(listener, make_service).await?;
    Ok(())
}

/// Installs the tracing subscriber. `LOG_FORMAT=json` switches to JSON lines;
/// a `SENTRY_DSN` adds error reporting. The returned guard must stay alive.
fn init_tracing() -> Option<sentry::ClientInitGuard> {
    let sentry_guard = std::env::var("SENTRY_DSN")
        .ok()
        .filter(|dsn| !dsn.trim().is_empty())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .with(sentry_guard.as_ref().map(|_| sentry_tracing::layer()))
        .init();

    sentry_guard
}

fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid ALLOWED_ORIGINS entry");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}

async fn root() -> Response {
    JsonResponse::success("billing backend is running").into_response()
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPool::connect(database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("failed to verify database connection")?;

    info!("connected to the database");
    Ok(pool)
}
