use crate::{
    auth::AuthUser,
    db::DbPool,
    entities::order::{self, OrderStatus},
    entities::payment::{self, PaymentMethod, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    gateway::{CardSummary, CreateIntent, PaymentGateway, PaymentIntent},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Tunables for the payment lifecycle.
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    /// Allowed difference between a requested charge and the order total
    /// (currency minor-unit rounding).
    pub amount_tolerance: Decimal,
    /// How long an intent stays confirmable after gateway-side creation.
    pub intent_freshness: ChronoDuration,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            amount_tolerance: dec!(0.01),
            intent_freshness: ChronoDuration::hours(1),
        }
    }
}

/// Request to open a card payment attempt for an order.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateIntentRequest {
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: Option<String>,
}

/// Client-facing result of intent creation.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct IntentCreated {
    pub client_secret: Option<String>,
    pub payment_intent_id: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Result of a lifecycle operation that touched both records.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PaymentWithOrder {
    pub payment: payment::Model,
    pub order: order::Model,
    pub payment_status: PaymentStatus,
}

/// Outcome of applying a status transition under the rank gate.
#[derive(Debug)]
pub enum TransitionOutcome {
    Applied {
        payment: payment::Model,
        order: order::Model,
    },
    /// The incoming status lost the rank gate (or re-applied the stored
    /// status); nothing was written.
    Discarded {
        payment: payment::Model,
        reason: String,
    },
}

/// A gateway event reduced to the fields the lifecycle needs. Built by the
/// webhook pipeline after signature verification.
#[derive(Debug, Clone)]
pub struct GatewayEventApplication {
    pub transaction_id: String,
    pub order_id: Option<Uuid>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub failure_message: Option<String>,
    pub card: Option<CardSummary>,
    pub payload: serde_json::Value,
}

/// Outcome reported back to the webhook endpoint.
#[derive(Debug)]
pub enum WebhookOutcome {
    Applied { payment_id: Uuid },
    Discarded { reason: String },
    /// The event referenced an order we do not have. Acknowledged so the
    /// gateway stops retrying a data error it cannot fix.
    OrderMissing,
}

/// Payment lifecycle controller.
///
/// Owns every mutation of payment rows and of the order-side payment
/// projection. Both the client-facing operations and the webhook pipeline
/// funnel through the same rank-gated transition, applied to the Payment
/// and the Order inside one database transaction.
pub struct PaymentService {
    db: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: Option<Arc<EventSender>>,
    settings: PaymentSettings,
}

impl PaymentService {
    pub fn new(
        db: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: Option<Arc<EventSender>>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            event_sender,
            settings,
        }
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    /// Open a card payment attempt: validate, create the gateway intent,
    /// record the pending Payment row and stamp the order projection.
    #[instrument(skip(self, requester), fields(order_id = %request.order_id, amount = %request.amount))]
    pub async fn create_intent(
        &self,
        request: CreateIntentRequest,
        requester: &AuthUser,
    ) -> Result<IntentCreated, ServiceError> {
        let order = self.load_order(request.order_id).await?;
        authorize_order_access(requester, &order)?;

        if order.is_paid {
            return Err(ServiceError::AlreadyProcessed(
                "order is already paid".to_string(),
            ));
        }
        self.check_amount(&order, request.amount)?;

        let currency = request
            .currency
            .unwrap_or_else(|| order.currency.clone())
            .to_ascii_lowercase();

        // The gateway call happens before any local write: if it fails, no
        // Payment row exists and the client can simply retry.
        let intent = self
            .gateway
            .create_intent(CreateIntent {
                amount: request.amount,
                currency: currency.clone(),
                order_id: order.id,
                description: Some(format!("Payment for order {}", order.order_number)),
            })
            .await?;

        let now = Utc::now();
        let txn = self.db.begin().await?;

        // Re-use a still-pending card attempt instead of piling up rows.
        let existing = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Method.eq(PaymentMethod::Card))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .one(&txn)
            .await?;

        let payment_model = match existing {
            Some(existing) => {
                let mut active: payment::ActiveModel = existing.into();
                active.amount = Set(request.amount);
                active.currency = Set(currency.clone());
                active.gateway = Set(self.gateway.name().to_string());
                active.transaction_id = Set(Some(intent.id.clone()));
                active.updated_at = Set(Some(now));
                active.update(&txn).await?
            }
            None => {
                payment::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order.id),
                    customer_id: Set(order.customer_id),
                    amount: Set(request.amount),
                    currency: Set(currency.clone()),
                    method: Set(PaymentMethod::Card),
                    gateway: Set(self.gateway.name().to_string()),
                    transaction_id: Set(Some(intent.id.clone())),
                    status: Set(PaymentStatus::Pending),
                    card_last4: Set(None),
                    card_brand: Set(None),
                    card_expiry: Set(None),
                    gateway_response: Set(None),
                    failure_reason: Set(None),
                    processed_at: Set(None),
                    refunded_at: Set(None),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                }
                .insert(&txn)
                .await?
            }
        };

        let mut order_active: order::ActiveModel = order.into();
        order_active.payment_method = Set(PaymentMethod::Card.to_string());
        order_active.payment_status = Set(PaymentStatus::Pending);
        order_active.payment_initiated_at = Set(Some(now));
        order_active.updated_at = Set(Some(now));
        order_active.update(&txn).await?;

        txn.commit().await?;

        counter!("storefront_payments.intent_created", 1);
        self.emit(Event::PaymentInitiated(payment_model.id)).await;

        info!(payment_id = %payment_model.id, intent_id = %intent.id, "payment intent created");

        Ok(IntentCreated {
            client_secret: intent.client_secret,
            payment_intent_id: intent.id,
            amount: intent.amount,
            currency: intent.currency,
        })
    }

    /// Confirm a card attempt after client-side authentication. The gateway
    /// is the source of truth: we retrieve the intent's current state rather
    /// than trusting anything the client asserts.
    #[instrument(skip(self, requester), fields(order_id = %order_id))]
    pub async fn confirm_intent(
        &self,
        payment_intent_id: &str,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<PaymentWithOrder, ServiceError> {
        let order = self.load_order(order_id).await?;
        authorize_order_access(requester, &order)?;

        let intent = self.gateway.retrieve_intent(payment_intent_id).await?;

        if Utc::now() - intent.created > self.settings.intent_freshness {
            return Err(ServiceError::SessionExpired);
        }

        let payment = payment::Entity::find()
            .filter(payment::Column::TransactionId.eq(payment_intent_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "no payment attempt for intent {}",
                    payment_intent_id
                ))
            })?;

        if payment.order_id != order.id {
            return Err(ServiceError::BadRequest(
                "payment intent does not belong to this order".to_string(),
            ));
        }

        if payment.status == PaymentStatus::Completed {
            return Err(ServiceError::AlreadyProcessed(format!(
                "transaction {} is already completed",
                payment_intent_id
            )));
        }

        let target = intent.status.as_payment_status();
        let failure_reason = match target {
            PaymentStatus::Canceled | PaymentStatus::Failed => intent.last_error.clone(),
            _ => None,
        };

        let outcome = self
            .apply_transition(
                payment.id,
                target,
                Some(intent_audit_payload(&intent)),
                failure_reason,
                intent.card.clone(),
            )
            .await?;

        let (payment, order) = match outcome {
            TransitionOutcome::Applied { payment, order } => (payment, order),
            TransitionOutcome::Discarded { payment, reason } => {
                info!(payment_id = %payment.id, %reason, "confirm left payment unchanged");
                let order = self.load_order(order_id).await?;
                (payment, order)
            }
        };

        Ok(PaymentWithOrder {
            payment_status: payment.status,
            payment,
            order,
        })
    }

    /// Record a cash payment for an order. The attempt stays financially
    /// `pending` until an administrator settles it, but the order advances
    /// to `confirmed` so fulfillment can start.
    #[instrument(skip(self, requester), fields(order_id = %order_id, amount = %amount))]
    pub async fn confirm_cash(
        &self,
        order_id: Uuid,
        amount: Decimal,
        requester: &AuthUser,
    ) -> Result<PaymentWithOrder, ServiceError> {
        let order = self.load_order(order_id).await?;
        authorize_order_access(requester, &order)?;

        if order.is_paid {
            return Err(ServiceError::AlreadyProcessed(
                "order is already paid".to_string(),
            ));
        }
        self.check_amount(&order, amount)?;

        let now = Utc::now();
        let txn = self.db.begin().await?;

        let existing = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Method.eq(PaymentMethod::Cash))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .one(&txn)
            .await?;

        let payment_model = match existing {
            Some(existing) => {
                let mut active: payment::ActiveModel = existing.into();
                active.amount = Set(amount);
                active.updated_at = Set(Some(now));
                active.update(&txn).await?
            }
            None => {
                payment::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order.id),
                    customer_id: Set(order.customer_id),
                    amount: Set(amount),
                    currency: Set(order.currency.clone()),
                    method: Set(PaymentMethod::Cash),
                    gateway: Set("cash".to_string()),
                    transaction_id: Set(Some(format!("cash_{}", Uuid::new_v4().simple()))),
                    status: Set(PaymentStatus::Pending),
                    card_last4: Set(None),
                    card_brand: Set(None),
                    card_expiry: Set(None),
                    gateway_response: Set(None),
                    failure_reason: Set(None),
                    processed_at: Set(None),
                    refunded_at: Set(None),
                    created_at: Set(now),
                    updated_at: Set(Some(now)),
                }
                .insert(&txn)
                .await?
            }
        };

        let mut order_active: order::ActiveModel = order.clone().into();
        order_active.payment_method = Set(PaymentMethod::Cash.to_string());
        order_active.payment_status = Set(PaymentStatus::Pending);
        order_active.payment_initiated_at = Set(Some(now));
        if order.status == OrderStatus::Pending {
            order_active.status = Set(OrderStatus::Confirmed);
        }
        order_active.updated_at = Set(Some(now));
        let order_model = order_active.update(&txn).await?;

        txn.commit().await?;

        counter!("storefront_payments.cash_recorded", 1);
        self.emit(Event::PaymentInitiated(payment_model.id)).await;

        Ok(PaymentWithOrder {
            payment_status: payment_model.status,
            payment: payment_model,
            order: order_model,
        })
    }

    /// Administrative status override, used for manual reconciliation:
    /// settling a collected cash payment, or issuing a refund. Runs through
    /// the same rank gate as every other writer; re-applying the stored
    /// status is a no-op, not an error.
    #[instrument(skip(self, requester), fields(payment_id = %payment_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        payment_id: Uuid,
        new_status: PaymentStatus,
        requester: &AuthUser,
    ) -> Result<PaymentWithOrder, ServiceError> {
        if !requester.is_admin() {
            return Err(ServiceError::Forbidden(
                "administrator role required".to_string(),
            ));
        }

        let payment = payment::Entity::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;

        if payment.status == new_status {
            // Idempotent override, e.g. re-issuing a refund.
            let order = self.load_order(payment.order_id).await?;
            return Ok(PaymentWithOrder {
                payment_status: payment.status,
                payment,
                order,
            });
        }

        if !payment.status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStatus(format!(
                "cannot move payment from {} to {}",
                payment.status, new_status
            )));
        }

        // Refunding a card payment goes through the gateway first; if that
        // fails the local records stay untouched.
        let refund_payload = if new_status == PaymentStatus::Refunded
            && payment.method == PaymentMethod::Card
        {
            let transaction_id = payment.transaction_id.as_deref().ok_or_else(|| {
                ServiceError::InvalidStatus(
                    "payment has no transaction id to refund against".to_string(),
                )
            })?;
            let refund = self.gateway.refund(transaction_id, None).await?;
            Some(json!({ "refund_id": refund.id, "refund_status": refund.status }))
        } else {
            None
        };

        let outcome = self
            .apply_transition(payment.id, new_status, refund_payload, None, None)
            .await?;

        match outcome {
            TransitionOutcome::Applied { payment, order } => Ok(PaymentWithOrder {
                payment_status: payment.status,
                payment,
                order,
            }),
            TransitionOutcome::Discarded { payment, reason } => {
                // A concurrent writer won the race; the override still lost
                // the rank gate and must say so.
                warn!(payment_id = %payment.id, %reason, "status override discarded");
                Err(ServiceError::InvalidStatus(reason))
            }
        }
    }

    /// Apply a verified gateway event. Upserts the Payment row (the webhook
    /// can outrun the local insert) and funnels into the shared rank-gated
    /// transition.
    #[instrument(skip(self, application), fields(transaction_id = %application.transaction_id, target = %target))]
    pub async fn apply_gateway_event(
        &self,
        application: GatewayEventApplication,
        target: PaymentStatus,
    ) -> Result<WebhookOutcome, ServiceError> {
        let existing = payment::Entity::find()
            .filter(payment::Column::TransactionId.eq(application.transaction_id.as_str()))
            .one(&*self.db)
            .await?;

        if let Some(payment) = existing {
            // Secondary idempotency check: once a transaction is completed,
            // every further event for it is acknowledged and dropped.
            if payment.status == PaymentStatus::Completed {
                counter!("storefront_webhooks.duplicate_discarded", 1);
                return Ok(WebhookOutcome::Discarded {
                    reason: format!(
                        "transaction {} already completed",
                        application.transaction_id
                    ),
                });
            }

            let outcome = self
                .apply_transition(
                    payment.id,
                    target,
                    Some(application.payload),
                    application.failure_message,
                    application.card,
                )
                .await?;

            return Ok(match outcome {
                TransitionOutcome::Applied { payment, .. } => WebhookOutcome::Applied {
                    payment_id: payment.id,
                },
                TransitionOutcome::Discarded { reason, .. } => {
                    counter!("storefront_webhooks.stale_discarded", 1);
                    WebhookOutcome::Discarded { reason }
                }
            });
        }

        // No local row yet: the webhook raced ahead of (or replaced) the
        // client flow. Create the attempt directly in the target status.
        let Some(order_id) = application.order_id else {
            warn!(transaction_id = %application.transaction_id, "webhook event carries no order reference");
            return Ok(WebhookOutcome::OrderMissing);
        };

        let Some(order) = order::Entity::find_by_id(order_id).one(&*self.db).await? else {
            warn!(%order_id, transaction_id = %application.transaction_id, "webhook event references unknown order");
            return Ok(WebhookOutcome::OrderMissing);
        };

        // An event for a superseded intent must not mint a second attempt
        // once the order is settled: at most one completed payment per order.
        if order.is_paid {
            return Ok(WebhookOutcome::Discarded {
                reason: format!(
                    "order {} is already paid; event for unknown transaction {} dropped",
                    order.id, application.transaction_id
                ),
            });
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;

        let mut active = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            customer_id: Set(order.customer_id),
            amount: Set(application.amount.unwrap_or(order.total_price)),
            currency: Set(application
                .currency
                .unwrap_or_else(|| order.currency.clone())),
            method: Set(PaymentMethod::Card),
            gateway: Set(self.gateway.name().to_string()),
            transaction_id: Set(Some(application.transaction_id.clone())),
            status: Set(PaymentStatus::Pending),
            card_last4: Set(None),
            card_brand: Set(None),
            card_expiry: Set(None),
            gateway_response: Set(None),
            failure_reason: Set(None),
            processed_at: Set(None),
            refunded_at: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        };
        stamp_payment(
            &mut active,
            target,
            None,
            Some(application.payload),
            application.failure_message,
            application.card,
            now,
        );
        let payment_model = active.insert(&txn).await?;

        let mut order_active: order::ActiveModel = order.clone().into();
        project_order(
            &mut order_active,
            &order,
            target,
            payment_model.transaction_id.as_deref(),
            now,
        );
        let order_model = order_active.update(&txn).await?;

        txn.commit().await?;

        counter!("storefront_webhooks.upserted", 1);
        self.emit_status_events(&payment_model, &order_model, PaymentStatus::Pending, target)
            .await;

        Ok(WebhookOutcome::Applied {
            payment_id: payment_model.id,
        })
    }

    /// The single write path for status changes: re-checks the rank gate on
    /// fresh state inside a transaction, then updates the Payment row and
    /// the Order projection together. Either both records change or neither
    /// does.
    pub(crate) async fn apply_transition(
        &self,
        payment_id: Uuid,
        new_status: PaymentStatus,
        payload: Option<serde_json::Value>,
        failure_reason: Option<String>,
        card: Option<CardSummary>,
    ) -> Result<TransitionOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let payment = payment::Entity::find_by_id(payment_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;

        let old_status = payment.status;
        if old_status == new_status {
            txn.rollback().await?;
            return Ok(TransitionOutcome::Discarded {
                payment,
                reason: format!("status is already {}", new_status),
            });
        }
        if !old_status.can_transition_to(new_status) {
            txn.rollback().await?;
            return Ok(TransitionOutcome::Discarded {
                payment,
                reason: format!(
                    "stale transition {} -> {} rejected by rank gate",
                    old_status, new_status
                ),
            });
        }

        let order = order::Entity::find_by_id(payment.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", payment.order_id))
            })?;

        // At most one completed payment may exist per order; a second
        // attempt racing to completion loses, whatever its rank.
        if new_status == PaymentStatus::Completed {
            let other_completed = payment::Entity::find()
                .filter(payment::Column::OrderId.eq(order.id))
                .filter(payment::Column::Status.eq(PaymentStatus::Completed))
                .filter(payment::Column::Id.ne(payment_id))
                .one(&txn)
                .await?;
            if other_completed.is_some() {
                txn.rollback().await?;
                return Ok(TransitionOutcome::Discarded {
                    payment,
                    reason: format!(
                        "order {} already has a completed payment",
                        order.id
                    ),
                });
            }
        }

        let now = Utc::now();

        let transaction_id = payment.transaction_id.clone();
        let previous_response = payment.gateway_response.clone();
        let mut payment_active: payment::ActiveModel = payment.into();
        stamp_payment(
            &mut payment_active,
            new_status,
            previous_response,
            payload,
            failure_reason,
            card,
            now,
        );
        let payment_model = payment_active.update(&txn).await?;

        let mut order_active: order::ActiveModel = order.clone().into();
        project_order(
            &mut order_active,
            &order,
            new_status,
            transaction_id.as_deref(),
            now,
        );
        let order_model = order_active.update(&txn).await?;

        txn.commit().await?;

        counter!("storefront_payments.transition_applied", 1);
        self.emit_status_events(&payment_model, &order_model, old_status, new_status)
            .await;

        Ok(TransitionOutcome::Applied {
            payment: payment_model,
            order: order_model,
        })
    }

    /// Payment records for one order, newest first.
    pub async fn get_order_payments(
        &self,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        let order = self.load_order(order_id).await?;
        authorize_order_access(requester, &order)?;

        let payments = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_desc(payment::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(payments)
    }

    /// The current (most recent) payment attempt for an order, if any.
    pub async fn current_payment(
        &self,
        order_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError> {
        let payment = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_desc(payment::Column::CreatedAt)
            .one(&*self.db)
            .await?;
        Ok(payment)
    }

    /// Payment records for one buyer, newest first.
    pub async fn get_user_payments(
        &self,
        user_id: Uuid,
        requester: &AuthUser,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        if !requester.is_admin() && !requester.owns(user_id) {
            return Err(ServiceError::Forbidden(
                "cannot view another user's payments".to_string(),
            ));
        }

        let payments = payment::Entity::find()
            .filter(payment::Column::CustomerId.eq(user_id))
            .order_by_desc(payment::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(payments)
    }

    /// Admin list with pagination and optional status filter.
    pub async fn list_payments(
        &self,
        page: u64,
        per_page: u64,
        status: Option<PaymentStatus>,
        requester: &AuthUser,
    ) -> Result<(Vec<payment::Model>, u64), ServiceError> {
        if !requester.is_admin() {
            return Err(ServiceError::Forbidden(
                "administrator role required".to_string(),
            ));
        }

        let mut query = payment::Entity::find();
        if let Some(status) = status {
            query = query.filter(payment::Column::Status.eq(status));
        }
        let paginator = query
            .order_by_desc(payment::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let payments = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((payments, total))
    }

    async fn load_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    fn check_amount(&self, order: &order::Model, amount: Decimal) -> Result<(), ServiceError> {
        if (amount - order.total_price).abs() > self.settings.amount_tolerance {
            return Err(ServiceError::AmountMismatch(format!(
                "expected {}, got {}",
                order.total_price, amount
            )));
        }
        Ok(())
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to send event");
            }
        }
    }

    async fn emit_status_events(
        &self,
        payment: &payment::Model,
        order: &order::Model,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
    ) {
        self.emit(Event::PaymentStatusChanged {
            payment_id: payment.id,
            order_id: order.id,
            old_status: old_status.to_string(),
            new_status: new_status.to_string(),
        })
        .await;

        let event = match new_status {
            PaymentStatus::Completed => Some(Event::PaymentCompleted(payment.id)),
            PaymentStatus::Failed => Some(Event::PaymentFailed(payment.id)),
            PaymentStatus::Canceled => Some(Event::PaymentCanceled(payment.id)),
            PaymentStatus::Refunded => Some(Event::PaymentRefunded(payment.id)),
            _ => None,
        };
        if let Some(event) = event {
            self.emit(event).await;
        }
    }
}

/// Owner-or-admin gate shared by the payment operations.
pub fn authorize_order_access(
    requester: &AuthUser,
    order: &order::Model,
) -> Result<(), ServiceError> {
    if requester.is_admin() || requester.owns(order.customer_id) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(
            "not authorized for this order".to_string(),
        ))
    }
}

/// Write the per-status fields onto a payment ActiveModel.
fn stamp_payment(
    active: &mut payment::ActiveModel,
    new_status: PaymentStatus,
    previous_response: Option<serde_json::Value>,
    payload: Option<serde_json::Value>,
    failure_reason: Option<String>,
    card: Option<CardSummary>,
    now: DateTime<Utc>,
) {
    active.status = Set(new_status);
    if let Some(appended) = append_audit(previous_response, payload) {
        active.gateway_response = Set(Some(appended));
    }
    if let Some(reason) = failure_reason {
        active.failure_reason = Set(Some(reason));
    }
    if let Some(card) = card {
        active.card_last4 = Set(Some(card.last4));
        active.card_brand = Set(Some(card.brand));
        active.card_expiry = Set(card.expiry);
    }
    match new_status {
        PaymentStatus::Completed => active.processed_at = Set(Some(now)),
        PaymentStatus::Refunded => active.refunded_at = Set(Some(now)),
        _ => {}
    }
    active.updated_at = Set(Some(now));
}

/// Write the payment projection onto an order ActiveModel.
fn project_order(
    active: &mut order::ActiveModel,
    order: &order::Model,
    new_status: PaymentStatus,
    transaction_id: Option<&str>,
    now: DateTime<Utc>,
) {
    active.payment_status = Set(new_status);
    active.payment_result = Set(Some(json!({
        "id": transaction_id,
        "status": new_status.to_string(),
        "update_time": now.to_rfc3339(),
    })));
    match new_status {
        PaymentStatus::Completed => {
            active.is_paid = Set(true);
            active.paid_at = Set(Some(now));
            active.status = Set(OrderStatus::Paid);
            active.payment_completed_at = Set(Some(now));
        }
        PaymentStatus::Failed => {
            active.payment_failed_at = Set(Some(now));
        }
        PaymentStatus::Canceled => {
            active.payment_canceled_at = Set(Some(now));
        }
        PaymentStatus::Refunded => {
            // The completed payment no longer exists once refunded; the
            // paid flag must follow, while paid_at stays as history.
            active.is_paid = Set(false);
        }
        PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::RequiresAction => {}
    }
    active.version = Set(order.version + 1);
    active.updated_at = Set(Some(now));
}

/// Append a gateway payload to the audit trail, normalizing to an array.
fn append_audit(
    existing: Option<serde_json::Value>,
    payload: Option<serde_json::Value>,
) -> Option<serde_json::Value> {
    let payload = payload?;
    let mut entries = match existing {
        Some(serde_json::Value::Array(items)) => items,
        Some(other) => vec![other],
        None => Vec::new(),
    };
    entries.push(payload);
    Some(serde_json::Value::Array(entries))
}

/// Diagnostic payload recorded when a client confirm reads intent state.
/// Deliberately excludes the client secret.
fn intent_audit_payload(intent: &PaymentIntent) -> serde_json::Value {
    json!({
        "id": intent.id,
        "status": intent.status,
        "amount": intent.amount,
        "currency": intent.currency,
        "error": intent.last_error,
        "source": "confirm",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_trail_appends_instead_of_overwriting() {
        let first = append_audit(None, Some(json!({"status": "processing"}))).unwrap();
        assert_eq!(first.as_array().unwrap().len(), 1);

        let second = append_audit(Some(first), Some(json!({"status": "succeeded"}))).unwrap();
        let entries = second.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["status"], "succeeded");
    }

    #[test]
    fn audit_trail_keeps_existing_when_no_payload() {
        let kept = append_audit(Some(json!([{"status": "processing"}])), None);
        assert!(kept.is_none()); // caller leaves the column untouched
    }
}
