pub mod common;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::gateway::{MockGateway, PaymentGateway, StripeGateway};
use crate::services::payments::{PaymentService, PaymentSettings};
use crate::webhooks::WebhookRouter;
use chrono::Duration as ChronoDuration;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<crate::services::orders::OrderService>,
    pub payments: Arc<PaymentService>,
    pub reconciliation: Arc<crate::services::reconciliation::ReconciliationService>,
    pub webhook_router: Arc<WebhookRouter>,
}

impl AppServices {
    /// Build the service container with the gateway selected by config.
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Result<Self, crate::errors::ServiceError> {
        let gateway: Arc<dyn PaymentGateway> =
            if config.payment_gateway.eq_ignore_ascii_case("stripe") {
                let secret = config.stripe_secret_key.clone().ok_or_else(|| {
                    crate::errors::ServiceError::InternalError(
                        "stripe gateway selected without a secret key".to_string(),
                    )
                })?;
                Arc::new(StripeGateway::new(
                    secret,
                    Duration::from_secs(config.gateway_timeout_secs),
                )?)
            } else {
                Arc::new(MockGateway::new())
            };

        Ok(Self::with_gateway(db_pool, event_sender, config, gateway))
    }

    /// Build the container around an explicit gateway instance (tests
    /// inject doubles through here).
    pub fn with_gateway(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let settings = PaymentSettings {
            amount_tolerance: dec!(0.01),
            intent_freshness: ChronoDuration::seconds(config.intent_freshness_secs as i64),
        };

        let orders = Arc::new(crate::services::orders::OrderService::new(
            db_pool.clone(),
            Some(event_sender.clone()),
        ));
        let payments = Arc::new(PaymentService::new(
            db_pool.clone(),
            gateway,
            Some(event_sender),
            settings,
        ));
        let reconciliation = Arc::new(crate::services::reconciliation::ReconciliationService::new(
            db_pool,
        ));
        let webhook_router = Arc::new(WebhookRouter::with_default_handlers());

        Self {
            orders,
            payments,
            reconciliation,
            webhook_router,
        }
    }
}
