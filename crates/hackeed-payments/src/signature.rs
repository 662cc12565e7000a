//! Webhook Signature Verification
//!
//! Stripe signs `"{timestamp}.{raw body}"` with HMAC-SHA256 and sends
//! `stripe-signature: t=<timestamp>,v1=<hex>[,v1=<hex>...]`. Verification
//! runs against the raw bytes; the body is parsed only after it passes.

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{PaymentError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default timestamp tolerance in seconds
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verified webhook event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider event id (`evt_...`)
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub created: Option<i64>,

    #[serde(default)]
    pub livemode: bool,

    pub data: EventData,

    /// Entire event body as received
    #[serde(skip)]
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl WebhookEvent {
    /// Parse an already verified body
    pub fn from_value(payload: Value) -> Result<Self> {
        let mut event: Self = serde_json::from_value(payload.clone())
            .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;
        if event.id.is_empty() || event.event_type.is_empty() {
            return Err(PaymentError::InvalidPayload("event id and type are required".into()));
        }
        event.payload = payload;
        Ok(event)
    }

    /// `data.object.id`
    pub fn object_id(&self) -> Result<&str> {
        self.object_str("id")
            .ok_or_else(|| PaymentError::InvalidPayload("data.object.id is missing".into()))
    }

    /// String field of `data.object`
    pub fn object_str(&self, field: &str) -> Option<&str> {
        self.data
            .object
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Verifies `stripe-signature` headers against the endpoint secret
pub struct SignatureVerifier {
    secret: SecretString,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs.max(0);
        self
    }

    /// Verify against the current time
    pub fn verify(&self, payload: &[u8], header: &str) -> Result<()> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    /// Verify as if the current unix time were `now`
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<()> {
        let (timestamp, signatures) = parse_header(header)?;

        if now.abs_diff(timestamp) > self.tolerance_secs.unsigned_abs() {
            return Err(PaymentError::InvalidSignature(
                "Timestamp outside the tolerance zone".into(),
            ));
        }

        let mac = self.mac(timestamp, payload)?;
        let matched = signatures.iter().any(|signature| {
            hex::decode(signature)
                .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            Err(PaymentError::InvalidSignature(
                "No signatures found matching the expected signature for payload".into(),
            ))
        }
    }

    /// Verify and parse the event
    pub fn construct_event(&self, payload: &[u8], header: &str) -> Result<WebhookEvent> {
        self.verify(payload, header)?;
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;
        WebhookEvent::from_value(value)
    }

    /// Header value for `payload` signed at `timestamp`
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String> {
        let signature = self.mac(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={timestamp},v1={}", hex::encode(signature)))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| PaymentError::Config(format!("webhook secret: {e}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}

fn parse_header(header: &str) -> Result<(i64, Vec<&str>)> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse::<i64>().ok(),
                "v1" => signatures.push(value),
                _ => {}
            }
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok((timestamp, signatures)),
        _ => Err(PaymentError::InvalidSignature(
            "Unable to extract timestamp and signatures from header".into(),
        )),
    }
}
