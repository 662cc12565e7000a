//! # hackeed-payments
//!
//! Checkout → payment → webhook reconciliation for the Hackeed storefront.
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────┐     ┌─────────────┐
//! │  Storefront │────▶│  Stripe Hosted  │────▶│  /success   │
//! │   (cart)    │     │  Checkout Page  │     │  (verify)   │
//! └─────────────┘     └────────┬────────┘     └─────────────┘
//!                              │ checkout.session.completed
//!                              ▼
//!                     ┌─────────────────┐
//!                     │ WebhookProcessor│──▶ orders, items, stock
//!                     └─────────────────┘
//! ```
//!
//! 1. [`CheckoutService`] re-prices the cart from the catalog and creates a
//!    hosted session; client-submitted prices are ignored.
//! 2. [`WebhookProcessor`] verifies the `stripe-signature` header,
//!    deduplicates by event id and applies order and stock changes once.
//! 3. [`PaymentVerifier`] answers the success page with a sanitized view.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hackeed_payments::{CheckoutRequest, CheckoutService, CheckoutSettings, StripeClient};
//!
//! let provider = Arc::new(StripeClient::new("sk_test_xxx"));
//! let checkout = CheckoutService::new(
//!     CartValidator::new(catalog.clone()),
//!     provider.clone(),
//!     CheckoutSettings::from_base_url("https://hackeed.example"),
//! );
//!
//! let session = checkout.create_session(&request).await?;
//! // Redirect the shopper to: session.url
//! ```

mod checkout;
mod error;
pub mod provider;
mod signature;
mod verify;
mod webhook;

pub use checkout::{
    CheckoutRequest, CheckoutService, CheckoutSession, CheckoutSettings, SESSION_ID_PLACEHOLDER,
    SESSION_SOURCE,
};
pub use error::{PaymentError, Result};
pub use provider::{MockFailure, MockPaymentProvider, PaymentProvider, StripeClient};
pub use signature::{EventData, SignatureVerifier, WebhookEvent, DEFAULT_TOLERANCE_SECS};
pub use verify::{
    mask_name, OrderItemView, OrderView, OverallStatus, PaymentIntentView, PaymentVerification,
    PaymentVerifier, SessionView, VerificationQuery, VerificationType,
};
pub use webhook::{EventKind, WebhookOutcome, WebhookProcessor};
