//! Router and CORS policies.
//!
//! Checkout accepts any origin. Verification only answers the configured
//! storefront origins. Every endpoint is also mounted under its legacy
//! `/.netlify/functions/*` path so deployed storefront builds keep working.

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::{MethodRouter, get, post},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    create_checkout, health_check, method_not_allowed, preflight, readiness_check,
    stripe_webhook, verify_payment,
};
use crate::state::AppState;

pub const CHECKOUT_PATH: &str = "/api/checkout";
pub const WEBHOOK_PATH: &str = "/api/webhooks/stripe";
pub const VERIFY_PATH: &str = "/api/payments/verify";

const CHECKOUT_ALIAS: &str = "/.netlify/functions/stripe_checkout";
const WEBHOOK_ALIAS: &str = "/.netlify/functions/stripe_webhook";
const VERIFY_ALIAS: &str = "/.netlify/functions/stripe_verify";

/// Build the application router
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let checkout_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let verify_cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origin_values(allowed_origins)))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let checkout: MethodRouter<AppState> = post(create_checkout)
        .options(preflight)
        .fallback(method_not_allowed);
    let webhook: MethodRouter<AppState> = post(stripe_webhook).fallback(method_not_allowed);
    let verify: MethodRouter<AppState> = get(verify_payment)
        .options(preflight)
        .fallback(method_not_allowed);

    let checkout_routes = Router::new()
        .route(CHECKOUT_PATH, checkout.clone())
        .route(CHECKOUT_ALIAS, checkout)
        .layer(checkout_cors);

    let verify_routes = Router::new()
        .route(VERIFY_PATH, verify.clone())
        .route(VERIFY_ALIAS, verify)
        .layer(verify_cors);

    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .route(WEBHOOK_PATH, webhook.clone())
        .route(WEBHOOK_ALIAS, webhook)
        .merge(checkout_routes)
        .merge(verify_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn origin_values(origins: &[String]) -> Vec<HeaderValue> {
    origins
        .iter()
        .filter_map(|origin| {
            HeaderValue::from_str(origin)
                .inspect_err(|_| tracing::warn!(origin = %origin, "Ignoring invalid CORS origin"))
                .ok()
        })
        .collect()
}
