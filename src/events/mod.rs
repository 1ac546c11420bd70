use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// The events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment events
    PaymentInitiated(Uuid),
    PaymentCompleted(Uuid),
    PaymentFailed(Uuid),
    PaymentCanceled(Uuid),
    PaymentRefunded(Uuid),
    PaymentStatusChanged {
        payment_id: Uuid,
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
}

// Processes incoming events. Handlers here are the integration point for
// notification fan-out; today they record the event stream.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::OrderCreated(order_id) => {
                info!(%order_id, "order created");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
            Event::PaymentInitiated(payment_id) => {
                info!(%payment_id, "payment initiated");
            }
            Event::PaymentCompleted(payment_id) => {
                info!(%payment_id, "payment completed");
            }
            Event::PaymentFailed(payment_id) => {
                warn!(%payment_id, "payment failed");
            }
            Event::PaymentCanceled(payment_id) => {
                info!(%payment_id, "payment canceled");
            }
            Event::PaymentRefunded(payment_id) => {
                info!(%payment_id, "payment refunded");
            }
            Event::PaymentStatusChanged {
                payment_id,
                order_id,
                old_status,
                new_status,
            } => {
                info!(%payment_id, %order_id, %old_status, %new_status, "payment status changed");
            }
        }
    }

    warn!("Event processing loop has ended");
}
