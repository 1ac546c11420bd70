use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, instrument, warn};

use super::{CreateIntent, IntentStatus, PaymentGateway, PaymentIntent, RefundOutcome};
use crate::errors::ServiceError;

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Stripe REST client. Amounts cross the wire in minor units; all calls are
/// bounded by the configured timeout and failures surface as
/// `ServiceError::GatewayError` with local state untouched.
pub struct StripeGateway {
    http: reqwest::Client,
    secret_key: String,
    base_url: String,
}

impl StripeGateway {
    pub fn new(secret_key: String, timeout: Duration) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::GatewayError(format!("failed to build client: {}", e)))?;

        Ok(Self {
            http,
            secret_key,
            base_url: STRIPE_API_BASE.to_string(),
        })
    }

    /// Point the client at a different base URL (local stripe-mock).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
        (amount * dec!(100)).round().to_i64().ok_or_else(|| {
            ServiceError::GatewayError(format!("amount {} not representable in minor units", amount))
        })
    }

    async fn parse_intent(&self, response: reqwest::Response) -> Result<PaymentIntent, ServiceError> {
        let status = response.status();
        if !status.is_success() {
            let body: StripeErrorEnvelope = response.json().await.map_err(|e| {
                ServiceError::GatewayError(format!("unreadable error response: {}", e))
            })?;
            let message = body
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}", status));
            warn!(%status, %message, "stripe rejected request");
            return Err(ServiceError::GatewayError(message));
        }

        let wire: StripeIntent = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("malformed intent response: {}", e)))?;
        wire.try_into()
    }
}

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    client_secret: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    created: i64,
    last_payment_error: Option<StripeError>,
}

#[derive(Debug, Deserialize)]
struct StripeError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: Option<StripeError>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
}

impl TryFrom<StripeIntent> for PaymentIntent {
    type Error = ServiceError;

    fn try_from(wire: StripeIntent) -> Result<Self, Self::Error> {
        let status = IntentStatus::from_wire(&wire.status).ok_or_else(|| {
            ServiceError::GatewayError(format!("unknown intent status: {}", wire.status))
        })?;
        let created = DateTime::<Utc>::from_timestamp(wire.created, 0)
            .ok_or_else(|| ServiceError::GatewayError("invalid created timestamp".to_string()))?;

        Ok(PaymentIntent {
            id: wire.id,
            client_secret: wire.client_secret,
            amount: Decimal::new(wire.amount, 2),
            currency: wire.currency,
            status,
            created,
            last_error: wire.last_payment_error.and_then(|e| e.message),
            // Card display data arrives through webhook charge payloads, not
            // the intent object.
            card: None,
        })
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &str {
        "stripe"
    }

    #[instrument(skip(self, req), fields(order_id = %req.order_id, amount = %req.amount))]
    async fn create_intent(&self, req: CreateIntent) -> Result<PaymentIntent, ServiceError> {
        let amount = Self::to_minor_units(req.amount)?;
        let currency = req.currency.to_ascii_lowercase();
        let order_id = req.order_id.to_string();

        let mut form: Vec<(&str, String)> = vec![
            ("amount", amount.to_string()),
            ("currency", currency),
            ("metadata[order_id]", order_id),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];
        if let Some(description) = req.description {
            form.push(("description", description));
        }

        let response = self
            .http
            .post(format!("{}/payment_intents", self.base_url))
            .basic_auth(&self.secret_key, Option::<&str>::None)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "stripe create_intent transport failure");
                ServiceError::GatewayError(format!("create intent failed: {}", e))
            })?;

        self.parse_intent(response).await
    }

    #[instrument(skip(self))]
    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        let response = self
            .http
            .get(format!("{}/payment_intents/{}", self.base_url, intent_id))
            .basic_auth(&self.secret_key, Option::<&str>::None)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "stripe retrieve_intent transport failure");
                ServiceError::GatewayError(format!("retrieve intent failed: {}", e))
            })?;

        self.parse_intent(response).await
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        intent_id: &str,
        amount: Option<Decimal>,
    ) -> Result<RefundOutcome, ServiceError> {
        let mut form: Vec<(&str, String)> = vec![("payment_intent", intent_id.to_string())];
        if let Some(amount) = amount {
            form.push(("amount", Self::to_minor_units(amount)?.to_string()));
        }

        let response = self
            .http
            .post(format!("{}/refunds", self.base_url))
            .basic_auth(&self.secret_key, Option::<&str>::None)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "stripe refund transport failure");
                ServiceError::GatewayError(format!("refund failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: StripeErrorEnvelope = response.json().await.map_err(|e| {
                ServiceError::GatewayError(format!("unreadable error response: {}", e))
            })?;
            let message = body
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(ServiceError::GatewayError(message));
        }

        let refund: StripeRefund = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayError(format!("malformed refund response: {}", e)))?;

        Ok(RefundOutcome {
            id: refund.id,
            status: refund.status,
        })
    }
}
