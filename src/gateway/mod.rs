use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::payment::PaymentStatus;
use crate::errors::ServiceError;

mod mock;
mod stripe;

pub use mock::MockGateway;
pub use stripe::StripeGateway;

/// Status of a gateway-side payment intent, as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    Succeeded,
    Canceled,
}

impl IntentStatus {
    /// Map a wire-format status string to the enum. Unknown strings are
    /// surfaced to the caller as a malformed gateway response.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "requires_payment_method" => Some(Self::RequiresPaymentMethod),
            "requires_confirmation" => Some(Self::RequiresConfirmation),
            "requires_action" => Some(Self::RequiresAction),
            "processing" => Some(Self::Processing),
            "succeeded" => Some(Self::Succeeded),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// The internal payment status this gateway status maps to.
    pub fn as_payment_status(&self) -> PaymentStatus {
        match self {
            Self::RequiresPaymentMethod | Self::RequiresConfirmation => PaymentStatus::Pending,
            Self::RequiresAction => PaymentStatus::RequiresAction,
            Self::Processing => PaymentStatus::Processing,
            Self::Succeeded => PaymentStatus::Completed,
            Self::Canceled => PaymentStatus::Canceled,
        }
    }
}

/// Card display data attached to a charge (never the PAN or CVV).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSummary {
    pub last4: String,
    pub brand: String,
    pub expiry: Option<String>,
}

/// A gateway-side payment intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Gateway-assigned opaque id; doubles as our transaction id.
    pub id: String,
    /// Secret handed to the browser SDK to complete client-side auth.
    pub client_secret: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub status: IntentStatus,
    pub created: DateTime<Utc>,
    pub last_error: Option<String>,
    pub card: Option<CardSummary>,
}

/// Parameters for creating an intent.
#[derive(Debug, Clone)]
pub struct CreateIntent {
    pub amount: Decimal,
    pub currency: String,
    pub order_id: Uuid,
    pub description: Option<String>,
}

/// Result of a refund request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundOutcome {
    pub id: String,
    pub status: String,
}

/// Interface to the external payment gateway.
///
/// Injected into the payment lifecycle controller and the webhook pipeline
/// as an `Arc<dyn PaymentGateway>`, so tests can substitute a double. The
/// gateway is an unreliable asynchronous collaborator: every call is
/// bounded by a timeout and any transport failure surfaces as
/// `ServiceError::GatewayError` without touching local state.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Identifier recorded on payment rows ("stripe", "mock").
    fn name(&self) -> &str;

    async fn create_intent(&self, req: CreateIntent) -> Result<PaymentIntent, ServiceError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError>;

    /// Issue a refund for the given intent. `amount` of `None` refunds in
    /// full.
    async fn refund(
        &self,
        intent_id: &str,
        amount: Option<Decimal>,
    ) -> Result<RefundOutcome, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_statuses_map_to_payment_statuses() {
        assert_eq!(
            IntentStatus::from_wire("succeeded").unwrap().as_payment_status(),
            PaymentStatus::Completed
        );
        assert_eq!(
            IntentStatus::from_wire("processing").unwrap().as_payment_status(),
            PaymentStatus::Processing
        );
        assert_eq!(
            IntentStatus::from_wire("requires_action")
                .unwrap()
                .as_payment_status(),
            PaymentStatus::RequiresAction
        );
        assert_eq!(
            IntentStatus::from_wire("requires_payment_method")
                .unwrap()
                .as_payment_status(),
            PaymentStatus::Pending
        );
        assert_eq!(
            IntentStatus::from_wire("canceled").unwrap().as_payment_status(),
            PaymentStatus::Canceled
        );
        assert!(IntentStatus::from_wire("settled").is_none());
    }
}
