use chrono::{DateTime, Duration, Utc};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::{
        order,
        payment::{self, PaymentMethod, PaymentStatus},
    },
    errors::ServiceError,
};

/// Why an (Order, Payment) pair failed validation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValidationCode {
    Valid,
    InvalidMethod,
    MissingPayment,
    Failed,
    Canceled,
    StatusMismatch,
    PaidWithoutPayment,
    ExpiredPending,
    MethodMismatch,
}

/// Result of validating one order against its payment record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentValidation {
    pub is_valid: bool,
    pub code: ValidationCode,
    pub reasons: Vec<String>,
}

impl PaymentValidation {
    fn valid() -> Self {
        Self {
            is_valid: true,
            code: ValidationCode::Valid,
            reasons: Vec::new(),
        }
    }

    fn invalid(code: ValidationCode, reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            code,
            reasons: vec![reason.into()],
        }
    }
}

/// Age past which a pending payment is considered abandoned.
const STALE_PENDING_HOURS: i64 = 24;

/// Validate the payment state of an order against its (possibly absent)
/// payment record. Pure: reads nothing but its arguments, reports findings
/// and never corrects them; correction is an explicit admin action.
///
/// Checks run in order and short-circuit at the first failure.
pub fn validate_order_payment(
    order: &order::Model,
    payment: Option<&payment::Model>,
    now: DateTime<Utc>,
) -> PaymentValidation {
    // 1. The order must name a method we know how to settle.
    let method = match PaymentMethod::from_str(&order.payment_method) {
        Ok(method) => method,
        Err(_) => {
            return PaymentValidation::invalid(
                ValidationCode::InvalidMethod,
                format!("invalid payment method: {}", order.payment_method),
            );
        }
    };

    // 2. Card orders must have a payment record.
    if method == PaymentMethod::Card && payment.is_none() {
        return PaymentValidation::invalid(
            ValidationCode::MissingPayment,
            "missing payment record for card payment",
        );
    }

    if let Some(payment) = payment {
        // 3. Terminal failures invalidate the pair outright.
        if payment.status == PaymentStatus::Failed {
            return PaymentValidation::invalid(ValidationCode::Failed, "payment failed");
        }
        if payment.status == PaymentStatus::Canceled {
            return PaymentValidation::invalid(ValidationCode::Canceled, "payment canceled");
        }

        // 4. The order projection must agree with the payment record, minus
        // pairs that legitimately occur mid-flight.
        if order.payment_status != payment.status {
            let allowed = matches!(
                (order.payment_status, payment.status),
                (PaymentStatus::Pending, PaymentStatus::Completed)
                    | (PaymentStatus::Pending, PaymentStatus::Processing)
            );
            if !allowed {
                return PaymentValidation::invalid(
                    ValidationCode::StatusMismatch,
                    format!(
                        "payment status mismatch: order={}, payment={}",
                        order.payment_status, payment.status
                    ),
                );
            }
        }
    }

    // 5. A paid order needs a completed payment to back it.
    let has_completed = payment
        .map(|p| p.status == PaymentStatus::Completed)
        .unwrap_or(false);
    if order.is_paid && !has_completed {
        return PaymentValidation::invalid(
            ValidationCode::PaidWithoutPayment,
            "order marked as paid but no successful payment found",
        );
    }

    if let Some(payment) = payment {
        // 6. Pending on both sides for too long means the attempt was
        // abandoned.
        if order.payment_status == PaymentStatus::Pending
            && payment.status == PaymentStatus::Pending
            && now - order.created_at > Duration::hours(STALE_PENDING_HOURS)
        {
            return PaymentValidation::invalid(
                ValidationCode::ExpiredPending,
                "payment pending for too long (over 24 hours)",
            );
        }

        // 7. The record's method must be consistent with the gateway that
        // produced it.
        if !payment.method.matches_gateway(&payment.gateway) {
            return PaymentValidation::invalid(
                ValidationCode::MethodMismatch,
                format!(
                    "payment method mismatch: method={}, gateway={}",
                    payment.method, payment.gateway
                ),
            );
        }
    }

    PaymentValidation::valid()
}

/// An order annotated with its validation result, for admin listings.
#[derive(Debug, Serialize, ToSchema)]
pub struct ValidatedOrder {
    #[serde(flatten)]
    pub order: order::Model,
    pub payment_validation: PaymentValidation,
}

/// Read-only reconciliation pass over orders and their payment records.
pub struct ReconciliationService {
    db: Arc<DbPool>,
}

impl ReconciliationService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    /// Validate a single order against its current payment attempt.
    #[instrument(skip(self), fields(order_id = %order.id))]
    pub async fn validate_order(
        &self,
        order: &order::Model,
    ) -> Result<PaymentValidation, ServiceError> {
        let payment = self.current_payment(order.id).await?;
        Ok(validate_order_payment(order, payment.as_ref(), Utc::now()))
    }

    /// Annotate every order with its validation result (admin view: nothing
    /// is hidden, inconsistencies are labeled).
    pub async fn annotate_orders(
        &self,
        orders: Vec<order::Model>,
    ) -> Result<Vec<ValidatedOrder>, ServiceError> {
        let mut annotated = Vec::with_capacity(orders.len());
        for order in orders {
            let validation = self.validate_order(&order).await?;
            annotated.push(ValidatedOrder {
                order,
                payment_validation: validation,
            });
        }
        Ok(annotated)
    }

    /// Keep only orders whose payment state validates (buyer view: broken
    /// pairs are hidden rather than exposed).
    pub async fn filter_valid_orders(
        &self,
        orders: Vec<order::Model>,
    ) -> Result<Vec<order::Model>, ServiceError> {
        let mut valid = Vec::with_capacity(orders.len());
        for order in orders {
            if self.validate_order(&order).await?.is_valid {
                valid.push(order);
            }
        }
        Ok(valid)
    }

    async fn current_payment(
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::order::OrderStatus;
    use rust_decimal_macros::dec;

    fn make_order() -> order::Model {
        let now = Utc::now();
        order::Model {
            id: Uuid::new_v4(),
            order_number: "ORD-00000001".into(),
            customer_id: Uuid::new_v4(),
            status: OrderStatus::Pending,
            items_price: dec!(1000),
            shipping_price: dec!(0),
            total_price: dec!(1000),
            currency: "usd".into(),
            payment_method: "card".into(),
            payment_status: PaymentStatus::Pending,
            is_paid: false,
            paid_at: None,
            payment_result: None,
            payment_initiated_at: None,
            payment_completed_at: None,
            payment_failed_at: None,
            payment_canceled_at: None,
            shipping_address: None,
            notes: None,
            created_at: now,
            updated_at: None,
            version: 1,
        }
    }

    fn make_payment(order: &order::Model, status: PaymentStatus) -> payment::Model {
        payment::Model {
            id: Uuid::new_v4(),
            order_id: order.id,
            customer_id: order.customer_id,
            amount: order.total_price,
            currency: order.currency.clone(),
            method: PaymentMethod::Card,
            gateway: "stripe".into(),
            transaction_id: Some("pi_test_123".into()),
            status,
            card_last4: None,
            card_brand: None,
            card_expiry: None,
            gateway_response: None,
            failure_reason: None,
            processed_at: None,
            refunded_at: None,
            created_at: order.created_at,
            updated_at: None,
        }
    }

    #[test]
    fn consistent_pair_is_valid() {
        let mut order = make_order();
        order.payment_status = PaymentStatus::Completed;
        order.is_paid = true;
        let payment = make_payment(&order, PaymentStatus::Completed);

        let result = validate_order_payment(&order, Some(&payment), Utc::now());
        assert!(result.is_valid);
        assert_eq!(result.code, ValidationCode::Valid);
    }

    #[test]
    fn unknown_method_is_flagged() {
        let mut order = make_order();
        order.payment_method = "barter".into();
        let result = validate_order_payment(&order, None, Utc::now());
        assert_eq!(result.code, ValidationCode::InvalidMethod);
    }

    #[test]
    fn card_order_without_payment_is_flagged() {
        let order = make_order();
        let result = validate_order_payment(&order, None, Utc::now());
        assert_eq!(result.code, ValidationCode::MissingPayment);
    }

    #[test]
    fn cash_order_without_payment_is_fine() {
        let mut order = make_order();
        order.payment_method = "cash".into();
        let result = validate_order_payment(&order, None, Utc::now());
        assert!(result.is_valid);
    }

    #[test]
    fn failed_and_canceled_payments_are_flagged() {
        let order = make_order();
        let failed = make_payment(&order, PaymentStatus::Failed);
        assert_eq!(
            validate_order_payment(&order, Some(&failed), Utc::now()).code,
            ValidationCode::Failed
        );

        let canceled = make_payment(&order, PaymentStatus::Canceled);
        assert_eq!(
            validate_order_payment(&order, Some(&canceled), Utc::now()).code,
            ValidationCode::Canceled
        );
    }

    #[test]
    fn transitional_mismatches_are_allowed() {
        let order = make_order(); // projection still pending
        let completed = make_payment(&order, PaymentStatus::Completed);
        assert!(validate_order_payment(&order, Some(&completed), Utc::now()).is_valid);

        let processing = make_payment(&order, PaymentStatus::Processing);
        assert!(validate_order_payment(&order, Some(&processing), Utc::now()).is_valid);
    }

    #[test]
    fn other_mismatches_are_flagged() {
        let mut order = make_order();
        order.payment_status = PaymentStatus::Completed;
        let payment = make_payment(&order, PaymentStatus::RequiresAction);
        let result = validate_order_payment(&order, Some(&payment), Utc::now());
        assert_eq!(result.code, ValidationCode::StatusMismatch);
    }

    #[test]
    fn paid_without_completed_payment_is_flagged() {
        let mut order = make_order();
        order.is_paid = true;
        order.payment_status = PaymentStatus::Completed;
        let result = validate_order_payment(&order, None, Utc::now());
        // Cash-method variant: no payment row required, but paid needs one.
        let mut cash_order = order.clone();
        cash_order.payment_method = "cash".into();
        assert_eq!(
            validate_order_payment(&cash_order, None, Utc::now()).code,
            ValidationCode::PaidWithoutPayment
        );
        // Card-method variant short-circuits at the missing record.
        assert_eq!(result.code, ValidationCode::MissingPayment);
    }

    #[test]
    fn stale_pending_is_flagged_after_24_hours() {
        let mut order = make_order();
        order.created_at = Utc::now() - Duration::hours(25);
        let payment = make_payment(&order, PaymentStatus::Pending);
        let result = validate_order_payment(&order, Some(&payment), Utc::now());
        assert_eq!(result.code, ValidationCode::ExpiredPending);

        // A fresh pending pair is fine.
        let fresh = make_order();
        let fresh_payment = make_payment(&fresh, PaymentStatus::Pending);
        assert!(validate_order_payment(&fresh, Some(&fresh_payment), Utc::now()).is_valid);
    }

    #[test]
    fn method_gateway_mismatch_is_flagged() {
        let mut order = make_order();
        order.payment_method = "cash".into();
        let mut payment = make_payment(&order, PaymentStatus::Pending);
        payment.method = PaymentMethod::Cash;
        payment.gateway = "stripe".into();
        let result = validate_order_payment(&order, Some(&payment), Utc::now());
        assert_eq!(result.code, ValidationCode::MethodMismatch);
    }
}
