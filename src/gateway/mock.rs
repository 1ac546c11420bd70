use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{CardSummary, CreateIntent, IntentStatus, PaymentGateway, PaymentIntent, RefundOutcome};
use crate::errors::ServiceError;

/// In-memory stand-in for the real gateway, used in development and tests.
///
/// Intents live in a map and advance only when a test (or a dev tool)
/// scripts them via [`MockGateway::set_status`], which mirrors how the real
/// gateway advances intents out-of-band of our API.
#[derive(Default)]
pub struct MockGateway {
    intents: DashMap<String, PaymentIntent>,
    refunds: DashMap<String, RefundOutcome>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the gateway-side status of an intent.
    pub fn set_status(&self, intent_id: &str, status: IntentStatus) {
        if let Some(mut intent) = self.intents.get_mut(intent_id) {
            intent.status = status;
        }
    }

    /// Backdate an intent's creation time.
    pub fn set_created(&self, intent_id: &str, created: DateTime<Utc>) {
        if let Some(mut intent) = self.intents.get_mut(intent_id) {
            intent.created = created;
        }
    }

    /// Attach card display data to an intent.
    pub fn set_card(&self, intent_id: &str, card: CardSummary) {
        if let Some(mut intent) = self.intents.get_mut(intent_id) {
            intent.card = Some(card);
        }
    }

    /// Record a declined attempt on an intent.
    pub fn set_error(&self, intent_id: &str, message: &str) {
        if let Some(mut intent) = self.intents.get_mut(intent_id) {
            intent.last_error = Some(message.to_string());
        }
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }

    fn random_suffix() -> String {
        thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(char::from)
            .collect()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_intent(&self, req: CreateIntent) -> Result<PaymentIntent, ServiceError> {
        let id = format!("pi_mock_{}", Uuid::new_v4().simple());
        let intent = PaymentIntent {
            id: id.clone(),
            client_secret: Some(format!("{}_secret_{}", id, Self::random_suffix())),
            amount: req.amount,
            currency: req.currency,
            status: IntentStatus::RequiresPaymentMethod,
            created: Utc::now(),
            last_error: None,
            card: None,
        };
        self.intents.insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<PaymentIntent, ServiceError> {
        self.intents
            .get(intent_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| {
                ServiceError::GatewayError(format!("no such payment intent: {}", intent_id))
            })
    }

    async fn refund(
        &self,
        intent_id: &str,
        _amount: Option<Decimal>,
    ) -> Result<RefundOutcome, ServiceError> {
        if !self.intents.contains_key(intent_id) {
            return Err(ServiceError::GatewayError(format!(
                "no such payment intent: {}",
                intent_id
            )));
        }
        let outcome = RefundOutcome {
            id: format!("re_mock_{}", Uuid::new_v4().simple()),
            status: "succeeded".to_string(),
        };
        self.refunds.insert(intent_id.to_string(), outcome.clone());
        Ok(outcome)
    }
}
