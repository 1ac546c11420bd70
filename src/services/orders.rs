use crate::{
    auth::AuthUser,
    db::DbPool,
    entities::order::{self, OrderStatus},
    entities::order_item,
    entities::payment::PaymentStatus,
    errors::ServiceError,
    events::{Event, EventSender},
    services::reconciliation::{ReconciliationService, ValidatedOrder},
};
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Difference between the stated total and the item sum we still accept
/// (covers shipping and tax variations the storefront applies client-side).
const PRICE_MISMATCH_ALLOWANCE: Decimal = dec!(100);

/// One line of a checkout request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemInput {
    pub product_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
    pub size: Option<String>,
}

/// Shipping destination captured at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct Address {
    #[validate(length(min = 1, message = "Address line is required"))]
    pub address: String,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemInput>,
    #[validate]
    pub shipping_address: Address,
    /// "card" (default) or "cash"
    pub payment_method: Option<String>,
    pub items_price: Option<Decimal>,
    pub shipping_price: Option<Decimal>,
    pub total_price: Decimal,
    #[validate(length(equal = 3, message = "Currency must be a 3-letter code"))]
    pub currency: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
    pub notes: Option<String>,
}

/// Service for managing orders. Payment projections on the order are owned
/// by the payment lifecycle controller; this service only touches
/// fulfillment fields.
pub struct OrderService {
    db: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    reconciliation: ReconciliationService,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        let reconciliation = ReconciliationService::new(db.clone());
        Self {
            db,
            event_sender,
            reconciliation,
        }
    }

    /// Creates a new order with its line items.
    #[instrument(skip(self, request, requester), fields(customer_id = %requester.user_id))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
        requester: &AuthUser,
    ) -> Result<order::Model, ServiceError> {
        request.validate()?;

        let customer_id = requester.id().ok_or_else(|| {
            ServiceError::ValidationError("requester id is not a valid UUID".to_string())
        })?;

        if request.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "No order items - add items to your cart before placing an order".to_string(),
            ));
        }
        for item in &request.items {
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(
                    "All items must have a quantity greater than 0".to_string(),
                ));
            }
            if item.price <= Decimal::ZERO {
                return Err(ServiceError::ValidationError(
                    "All items must have a positive price".to_string(),
                ));
            }
        }

        let computed_items_price: Decimal = request
            .items
            .iter()
            .map(|item| item.price * Decimal::from(item.quantity))
            .sum();
        let items_price = request.items_price.unwrap_or(computed_items_price);
        let shipping_price = request.shipping_price.unwrap_or(Decimal::ZERO);

        if request.total_price <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Invalid total price".to_string(),
            ));
        }
        if (request.total_price - items_price).abs() > PRICE_MISMATCH_ALLOWANCE {
            return Err(ServiceError::ValidationError(format!(
                "Price mismatch detected - total: {}, items: {}",
                request.total_price, items_price
            )));
        }

        let payment_method = match request.payment_method.as_deref() {
            None | Some("card") => "card".to_string(),
            Some("cash") => "cash".to_string(),
            Some(other) => {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid payment method: {}",
                    other
                )));
            }
        };

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = generate_order_number();
        let currency = request
            .currency
            .unwrap_or_else(|| "usd".to_string())
            .to_ascii_lowercase();

        let shipping_address = serde_json::to_value(&request.shipping_address)
            .map_err(|e| ServiceError::InternalError(format!("address encoding failed: {}", e)))?;

        let txn = self.db.begin().await?;

        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            customer_id: Set(customer_id),
            status: Set(OrderStatus::Pending),
            items_price: Set(items_price),
            shipping_price: Set(shipping_price),
            total_price: Set(request.total_price),
            currency: Set(currency),
            payment_method: Set(payment_method),
            payment_status: Set(PaymentStatus::Pending),
            is_paid: Set(false),
            paid_at: Set(None),
            payment_result: Set(None),
            payment_initiated_at: Set(None),
            payment_completed_at: Set(None),
            payment_failed_at: Set(None),
            payment_canceled_at: Set(None),
            shipping_address: Set(Some(shipping_address)),
            notes: Set(request.notes),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        }
        .insert(&txn)
        .await?;

        for item in &request.items {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                size: Set(item.size.clone()),
                quantity: Set(item.quantity),
                price: Set(item.price),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;

        info!(order_id = %order_id, customer_id = %customer_id, "order created");
        self.emit(Event::OrderCreated(order_id)).await;

        Ok(order_model)
    }

    /// Retrieves an order, enforcing owner-or-admin access.
    #[instrument(skip(self, requester), fields(order_id = %order_id))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<order::Model, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if !requester.is_admin() && !requester.owns(order.customer_id) {
            return Err(ServiceError::Forbidden(
                "not authorized to view this order".to_string(),
            ));
        }

        Ok(order)
    }

    /// Line items for an order the requester may see.
    pub async fn get_order_items(
        &self,
        order_id: Uuid,
        requester: &AuthUser,
    ) -> Result<Vec<order_item::Model>, ServiceError> {
        // Access check rides on the order lookup.
        self.get_order(order_id, requester).await?;

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(items)
    }

    /// The requester's own orders, filtered through the reconciliation
    /// validator so broken payment pairs stay hidden from buyers.
    #[instrument(skip(self, requester))]
    pub async fn my_orders(&self, requester: &AuthUser) -> Result<Vec<order::Model>, ServiceError> {
        let customer_id = requester.id().ok_or_else(|| {
            ServiceError::ValidationError("requester id is not a valid UUID".to_string())
        })?;

        let orders = order::Entity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        let before = orders.len();
        let visible = self.reconciliation.filter_valid_orders(orders).await?;
        if visible.len() < before {
            warn!(
                hidden = before - visible.len(),
                customer_id = %customer_id,
                "orders hidden from buyer due to payment inconsistencies"
            );
        }
        Ok(visible)
    }

    /// Admin listing: every order annotated with its validation result.
    #[instrument(skip(self, requester))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
        requester: &AuthUser,
    ) -> Result<(Vec<ValidatedOrder>, u64), ServiceError> {
        if !requester.is_admin() {
            return Err(ServiceError::Forbidden(
                "administrator role required".to_string(),
            ));
        }

        let paginator = order::Entity::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        let annotated = self.reconciliation.annotate_orders(orders).await?;
        Ok((annotated, total))
    }

    /// Fulfillment status updates. `paid` is unreachable from here: it is
    /// only ever entered by the payment engine flipping `is_paid`.
    #[instrument(skip(self, requester), fields(order_id = %order_id))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        request: UpdateOrderStatusRequest,
        requester: &AuthUser,
    ) -> Result<order::Model, ServiceError> {
        if !requester.is_admin() && !requester.has_role(crate::auth::ROLE_SUPPLIER) {
            return Err(ServiceError::Forbidden(
                "supplier or administrator role required".to_string(),
            ));
        }

        let new_status: OrderStatus = request
            .status
            .parse()
            .map_err(|_| ServiceError::InvalidStatus(format!("unknown status: {}", request.status)))?;
        if new_status == OrderStatus::Paid {
            return Err(ServiceError::InvalidStatus(
                "paid is set by the payment lifecycle, not by fulfillment".to_string(),
            ));
        }

        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        let now = Utc::now();
        let mut active: order::ActiveModel = order.clone().into();
        active.status = Set(new_status);
        if let Some(notes) = request.notes {
            active.notes = Set(Some(notes));
        }
        active.version = Set(order.version + 1);
        active.updated_at = Set(Some(now));
        let updated = active.update(&*self.db).await?;

        self.emit(Event::OrderStatusChanged {
            order_id,
            old_status: old_status.to_string(),
            new_status: new_status.to_string(),
        })
        .await;

        Ok(updated)
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to send event");
            }
        }
    }
}

fn generate_order_number() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000_000);
    format!("ORD-{:08}", suffix)
}
