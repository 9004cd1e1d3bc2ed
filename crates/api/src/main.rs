// API server clippy configuration
#![allow(clippy::single_match)]
#![allow(clippy::needless_borrows_for_generic_args)]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Chatgate API Server
//!
//! Serves the subscription-gated chat endpoint, subscription checkout and the
//! billing webhook receiver.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, Method};
use chatgate_api::{
    auth::HttpIdentityProvider, chat::HttpChatBackend, create_router, AppState, Config,
};
use chatgate_billing::{BillingOptions, BillingService, InMemoryLedgerStore, LedgerStore, PgLedgerStore};
use chatgate_shared::{create_pool, run_migrations};
use tokio::time::{interval, Duration};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often idle rate limit buckets are swept
const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    tracing::info!("Starting Chatgate API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let ledger: Arc<dyn LedgerStore> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = create_pool(database_url).await?;
            run_migrations(&pool).await?;
            Arc::new(PgLedgerStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set - subscription ledger is kept in memory");
            Arc::new(InMemoryLedgerStore::new())
        }
    };

    let billing = BillingService::from_env(
        ledger,
        BillingOptions {
            ledger_fast_path: config.entitlement_ledger_fast_path,
            ..BillingOptions::default()
        },
    )?;
    tracing::info!(
        ledger_fast_path = config.entitlement_ledger_fast_path,
        "Stripe billing service initialized"
    );

    let mut identity = HttpIdentityProvider::new(
        &config.identity_provider_url,
        &config.identity_provider_anon_key,
        config.upstream_timeout,
    )?;
    match &config.identity_jwt_secret {
        Some(secret) => {
            identity = identity.with_jwt_secret(secret);
            tracing::info!("Local session token validation enabled");
        }
        None => tracing::info!(
            "Identity verification via {}",
            config.identity_provider_url
        ),
    }

    let chat = HttpChatBackend::new(&config.chat_backend_url, config.chat_timeout)?;

    let state = AppState::new(
        config.clone(),
        Arc::new(billing),
        Arc::new(identity),
        Arc::new(chat),
    );

    // Sweep rate limit buckets that have refilled
    let rate_limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = interval(RATE_LIMIT_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            rate_limiter.cleanup().await;
        }
    });
    tracing::info!("Rate limiter cleanup task started");

    let allowed_origins: Vec<axum::http::HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .expose_headers([header::CONTENT_TYPE, header::RETRY_AFTER])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// `LOG_FORMAT=json` switches to structured JSON output
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,chatgate_api=debug,chatgate_billing=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
