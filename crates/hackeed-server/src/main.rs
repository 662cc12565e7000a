//! Hackeed storefront payment server
//!
//! Axum server for cart checkout, Stripe webhook reconciliation and
//! payment verification, backed by `PostgreSQL`.

mod config;
mod db;
mod error;
mod handlers;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hackeed_core::{CartValidator, CatalogStore, OrderLedger};
use hackeed_payments::{
    CheckoutService, PaymentProvider, PaymentVerifier, SignatureVerifier, StripeClient,
    WebhookProcessor,
};

use crate::config::{LogFormat, ServerConfig};
use crate::db::{PgCatalogStore, PgOrderLedger};
use crate::routes::{CHECKOUT_PATH, VERIFY_PATH, WEBHOOK_PATH};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env().context("Failed to load configuration")?;

    init_tracing(config.log_format);

    // Database
    let pool = db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to the database")?;
    tracing::info!("✓ Database pool created");

    if config.run_migrations {
        db::run_migrations(&pool)
            .await
            .context("Failed to apply migrations")?;
        tracing::info!("✓ Migrations applied");
    }

    let catalog: Arc<dyn CatalogStore> = Arc::new(PgCatalogStore::new(pool.clone()));
    let ledger: Arc<dyn OrderLedger> = Arc::new(PgOrderLedger::new(pool.clone()));

    // Payments
    let provider: Arc<dyn PaymentProvider> =
        Arc::new(StripeClient::new(config.stripe_secret_key.expose_secret()));
    let verifier = SignatureVerifier::new(config.webhook_secret.clone())
        .with_tolerance(config.webhook_tolerance_secs);

    let validator = CartValidator::new(catalog.clone()).with_max_quantity(config.max_quantity);

    let state = AppState {
        checkout: Arc::new(CheckoutService::new(
            validator,
            provider.clone(),
            config.checkout_settings(),
        )),
        webhooks: Arc::new(WebhookProcessor::new(
            verifier,
            catalog.clone(),
            ledger.clone(),
            provider.clone(),
        )),
        verifier: Arc::new(PaymentVerifier::new(catalog, ledger, provider)),
        db: Some(pool),
    };

    let app = routes::router(state, &config.allowed_origins);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 hackeed-server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                - Liveness");
    tracing::info!("  GET  /health/ready          - Database readiness");
    tracing::info!("  POST {CHECKOUT_PATH:<22} - Create checkout session");
    tracing::info!("  POST {WEBHOOK_PATH:<22} - Stripe webhook");
    tracing::info!("  GET  {VERIFY_PATH:<22} - Verify payment");
    tracing::info!("");
    tracing::info!("Storefront: {}", config.base_url);
    tracing::info!("Verification origins: {}", config.allowed_origins.join(", "));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());

    let json_layer = (format == LogFormat::Json)
        .then(|| tracing_subscriber::fmt::layer().json().flatten_event(true));
    let text_layer = (format == LogFormat::Text).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
