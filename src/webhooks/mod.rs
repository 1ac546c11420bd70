//! Webhook ingestion pipeline for gateway payment events.
//!
//! Nothing in an event is trusted until its signature verifies against the
//! pre-shared secret. Verified events are parsed into [`GatewayEvent`] and
//! dispatched through a handler registry keyed by event kind; every handler
//! funnels into the payment lifecycle's rank-gated transition, which makes
//! replays and out-of-order delivery converge to the same state.

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::entities::payment::PaymentStatus;
use crate::errors::ServiceError;
use crate::gateway::CardSummary;
use crate::services::payments::{GatewayEventApplication, PaymentService, WebhookOutcome};

type HmacSha256 = Hmac<Sha256>;

/// Event kinds the pipeline understands.
pub const EVENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const EVENT_PAYMENT_FAILED: &str = "payment_intent.payment_failed";
pub const EVENT_CANCELED: &str = "payment_intent.canceled";
pub const EVENT_REQUIRES_ACTION: &str = "payment_intent.requires_action";

/// A gateway event after signature verification and parsing.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    /// Gateway-side event id (used for logging; idempotency keys off the
    /// transaction id).
    pub id: Option<String>,
    pub kind: String,
    /// The payment-intent id; our transaction id.
    pub transaction_id: String,
    /// Order reference embedded in the intent's metadata.
    pub order_id: Option<Uuid>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub failure_message: Option<String>,
    pub card: Option<CardSummary>,
    pub raw: Value,
}

impl GatewayEvent {
    fn into_application(self) -> GatewayEventApplication {
        GatewayEventApplication {
            transaction_id: self.transaction_id,
            order_id: self.order_id,
            amount: self.amount,
            currency: self.currency,
            failure_message: self.failure_message,
            card: self.card,
            payload: self.raw,
        }
    }
}

/// Parse a raw event body. Call only after the signature verified.
pub fn parse_event(payload: &[u8]) -> Result<GatewayEvent, ServiceError> {
    let raw: Value = serde_json::from_slice(payload)
        .map_err(|e| ServiceError::BadRequest(format!("invalid event json: {}", e)))?;

    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("event has no type".to_string()))?
        .to_string();

    let object = raw
        .get("data")
        .and_then(|d| d.get("object"))
        .ok_or_else(|| ServiceError::BadRequest("event has no data.object".to_string()))?;

    let transaction_id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::BadRequest("event object has no id".to_string()))?
        .to_string();

    let order_id = object
        .get("metadata")
        .and_then(|m| m.get("order_id"))
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());

    let amount = object
        .get("amount")
        .and_then(Value::as_i64)
        .map(|minor| Decimal::new(minor, 2));

    let currency = object
        .get("currency")
        .and_then(Value::as_str)
        .map(str::to_string);

    let failure_message = object
        .get("last_payment_error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let card = object
        .get("charges")
        .and_then(|c| c.get("data"))
        .and_then(|d| d.get(0))
        .and_then(|charge| charge.get("payment_method_details"))
        .and_then(|details| details.get("card"))
        .and_then(|card| {
            Some(CardSummary {
                last4: card.get("last4")?.as_str()?.to_string(),
                brand: card.get("brand")?.as_str()?.to_string(),
                expiry: match (
                    card.get("exp_month").and_then(Value::as_i64),
                    card.get("exp_year").and_then(Value::as_i64),
                ) {
                    (Some(month), Some(year)) => Some(format!("{:02}/{:02}", month, year % 100)),
                    _ => None,
                },
            })
        });

    Ok(GatewayEvent {
        id: raw.get("id").and_then(Value::as_str).map(str::to_string),
        kind,
        transaction_id,
        order_id,
        amount,
        currency,
        failure_message,
        card,
        raw,
    })
}

/// Verify the signature header against the shared secret before trusting a
/// single byte of the payload.
///
/// Supports the gateway's `Stripe-Signature: t=...,v1=...` scheme and the
/// generic `x-timestamp`/`x-signature` pair, both HMAC-SHA256 over
/// `"{timestamp}.{body}"` with a bounded timestamp tolerance.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
) -> bool {
    let now = chrono::Utc::now().timestamp();

    if let (Some(ts), Some(sig)) = (headers.get("x-timestamp"), headers.get("x-signature")) {
        if let (Ok(ts), Ok(sig)) = (ts.to_str(), sig.to_str()) {
            if let Ok(ts_i) = ts.parse::<i64>() {
                if (now - ts_i).unsigned_abs() > tolerance_secs {
                    return false;
                }
            }
            return constant_time_eq(&expected_signature(ts, payload, secret), sig);
        }
    }

    if let Some(sig) = headers.get("Stripe-Signature").and_then(|h| h.to_str().ok()) {
        let mut ts = "";
        let mut v1 = "";
        for part in sig.split(',') {
            let mut it = part.trim().split('=');
            match (it.next(), it.next()) {
                (Some("t"), Some(val)) => ts = val,
                (Some("v1"), Some(val)) => v1 = val,
                _ => {}
            }
        }
        if !ts.is_empty() && !v1.is_empty() {
            if let Ok(ts_i) = ts.parse::<i64>() {
                if (now - ts_i).unsigned_abs() > tolerance_secs {
                    return false;
                }
            }
            return constant_time_eq(&expected_signature(ts, payload, secret), v1);
        }
    }

    false
}

fn expected_signature(timestamp: &str, payload: &[u8], secret: &str) -> String {
    let signed = format!("{}.{}", timestamp, std::str::from_utf8(payload).unwrap_or(""));
    // HMAC accepts keys of any length
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signed.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// A registered handler for one event kind.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn apply(
        &self,
        payments: &PaymentService,
        event: GatewayEvent,
    ) -> Result<WebhookOutcome, ServiceError>;
}

/// Handler that maps an event kind onto a target payment status and lets
/// the lifecycle's rank gate decide whether it lands.
struct StatusEventHandler {
    target: PaymentStatus,
}

#[async_trait]
impl WebhookHandler for StatusEventHandler {
    async fn apply(
        &self,
        payments: &PaymentService,
        event: GatewayEvent,
    ) -> Result<WebhookOutcome, ServiceError> {
        payments
            .apply_gateway_event(event.into_application(), self.target)
            .await
    }
}

/// Dispatch table keyed by event kind. Unknown kinds are acknowledged and
/// ignored; the gateway retries forever otherwise.
pub struct WebhookRouter {
    handlers: HashMap<&'static str, Arc<dyn WebhookHandler>>,
}

impl WebhookRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The standard event-to-status table.
    pub fn with_default_handlers() -> Self {
        let mut router = Self::new();
        router.register(
            EVENT_SUCCEEDED,
            Arc::new(StatusEventHandler {
                target: PaymentStatus::Completed,
            }),
        );
        router.register(
            EVENT_PAYMENT_FAILED,
            Arc::new(StatusEventHandler {
                target: PaymentStatus::Failed,
            }),
        );
        router.register(
            EVENT_CANCELED,
            Arc::new(StatusEventHandler {
                target: PaymentStatus::Canceled,
            }),
        );
        router.register(
            EVENT_REQUIRES_ACTION,
            Arc::new(StatusEventHandler {
                target: PaymentStatus::RequiresAction,
            }),
        );
        router
    }

    pub fn register(&mut self, kind: &'static str, handler: Arc<dyn WebhookHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub async fn dispatch(
        &self,
        payments: &PaymentService,
        event: GatewayEvent,
    ) -> Result<WebhookOutcome, ServiceError> {
        match self.handlers.get(event.kind.as_str()) {
            Some(handler) => handler.apply(payments, event).await,
            None => {
                info!(kind = %event.kind, "unhandled webhook event kind");
                Ok(WebhookOutcome::Discarded {
                    reason: format!("unhandled event kind: {}", event.kind),
                })
            }
        }
    }
}

impl Default for WebhookRouter {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}
