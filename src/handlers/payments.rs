use super::common::PaginationParams;
use crate::auth::AuthenticatedUser;
use crate::entities::payment::{self, PaymentStatus};
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payments::{CreateIntentRequest, IntentCreated, PaymentWithOrder};
use crate::ApiResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "order_id": "550e8400-e29b-41d4-a716-446655440000",
    "amount": "1000.00",
    "currency": "usd"
}))]
pub struct CreateIntentBody {
    /// Order to open a card payment attempt for
    pub order_id: Uuid,
    /// Charge amount; must match the order total
    #[validate(custom = "validate_positive_decimal")]
    pub amount: Decimal,
    /// Currency code (defaults to the order's currency)
    pub currency: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "payment_intent_id": "pi_3OqX8w2eZvKYlo2C1gFV7h9M",
    "order_id": "550e8400-e29b-41d4-a716-446655440000"
}))]
pub struct ConfirmIntentBody {
    #[validate(length(min = 1, message = "payment_intent_id is required"))]
    pub payment_intent_id: String,
    pub order_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({
    "order_id": "550e8400-e29b-41d4-a716-446655440000",
    "amount": "1000.00"
}))]
pub struct CashPaymentBody {
    pub order_id: Uuid,
    #[validate(custom = "validate_positive_decimal")]
    pub amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
#[schema(example = json!({ "status": "completed" }))]
pub struct UpdatePaymentStatusBody {
    /// Target status; must advance the payment's current status
    #[validate(length(min = 1, message = "status is required"))]
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, utoipa::IntoParams)]
pub struct PaymentStatusFilter {
    /// Filter by payment status (pending, processing, requires_action,
    /// completed, failed, canceled, refunded)
    pub status: Option<String>,
}

// Handler functions

/// Create a gateway payment intent for an order
#[utoipa::path(
    post,
    path = "/api/v1/payments/stripe/create-intent",
    request_body = CreateIntentBody,
    responses(
        (status = 201, description = "Intent created", body = crate::ApiResponse<crate::services::payments::IntentCreated>),
        (status = 400, description = "Amount mismatch or validation failure", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the order's owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 500, description = "Gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn create_stripe_intent(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateIntentBody>,
) -> Result<(StatusCode, Json<ApiResponse<IntentCreated>>), ServiceError> {
    body.validate()?;

    let request = CreateIntentRequest {
        order_id: body.order_id,
        amount: body.amount,
        currency: body.currency,
    };
    let created = state.services.payments.create_intent(request, &user).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

/// Confirm a card payment after client-side authentication
#[utoipa::path(
    post,
    path = "/api/v1/payments/stripe/confirm",
    request_body = ConfirmIntentBody,
    responses(
        (status = 200, description = "Current payment state", body = crate::ApiResponse<crate::services::payments::PaymentWithOrder>),
        (status = 400, description = "Expired session or replay", body = crate::errors::ErrorResponse),
        (status = 403, description = "Not the order's owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order or payment not found", body = crate::errors::ErrorResponse),
        (status = 500, description = "Gateway unavailable", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn confirm_stripe_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<ConfirmIntentBody>,
) -> Result<Json<ApiResponse<PaymentWithOrder>>, ServiceError> {
    body.validate()?;

    let confirmed = state
        .services
        .payments
        .confirm_intent(&body.payment_intent_id, body.order_id, &user)
        .await?;
    Ok(Json(ApiResponse::success(confirmed)))
}

/// Record a cash payment for an order
#[utoipa::path(
    post,
    path = "/api/v1/payments/cash",
    request_body = CashPaymentBody,
    responses(
        (status = 201, description = "Cash payment recorded", body = crate::ApiResponse<crate::services::payments::PaymentWithOrder>),
        (status = 400, description = "Amount mismatch", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn process_cash_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CashPaymentBody>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentWithOrder>>), ServiceError> {
    body.validate()?;

    let recorded = state
        .services
        .payments
        .confirm_cash(body.order_id, body.amount, &user)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(recorded))))
}

/// Get payment attempts for an order
#[utoipa::path(
    get,
    path = "/api/v1/payments/order/:order_id",
    params(("order_id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Payments for the order", body = crate::ApiResponse<Vec<crate::entities::payment::Model>>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn get_order_payments(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<Json<ApiResponse<Vec<payment::Model>>>, ServiceError> {
    let payments = state
        .services
        .payments
        .get_order_payments(order_id, &user)
        .await?;
    Ok(Json(ApiResponse::success(payments)))
}

/// Get payment attempts made by a user
#[utoipa::path(
    get,
    path = "/api/v1/payments/user/:user_id",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Payments for the user", body = crate::ApiResponse<Vec<crate::entities::payment::Model>>),
        (status = 403, description = "Not the user or an admin", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn get_user_payments(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<Json<ApiResponse<Vec<payment::Model>>>, ServiceError> {
    let payments = state
        .services
        .payments
        .get_user_payments(user_id, &user)
        .await?;
    Ok(Json(ApiResponse::success(payments)))
}

/// List all payments (admin)
#[utoipa::path(
    get,
    path = "/api/v1/payments",
    params(PaginationParams, PaymentStatusFilter),
    responses(
        (status = 200, description = "Paginated payments", body = crate::ApiResponse<crate::PaginatedResponse<crate::entities::payment::Model>>),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn list_payments(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
    Query(filter): Query<PaymentStatusFilter>,
    user: AuthenticatedUser,
) -> Result<Json<ApiResponse<crate::PaginatedResponse<payment::Model>>>, ServiceError> {
    let status_filter = match filter.status.as_deref() {
        Some(value) => Some(parse_status(value)?),
        None => None,
    };

    let (payments, total) = state
        .services
        .payments
        .list_payments(params.page, params.per_page, status_filter, &user)
        .await?;

    let response = crate::PaginatedResponse {
        items: payments,
        total,
        page: params.page,
        limit: params.per_page,
        total_pages: total.div_ceil(params.per_page.max(1)),
    };
    Ok(Json(ApiResponse::success(response)))
}

/// Override a payment's status (admin)
///
/// Used for manual reconciliation: settling a collected cash payment or
/// issuing a refund. The same monotonic status rule applies as everywhere
/// else.
#[utoipa::path(
    put,
    path = "/api/v1/payments/:payment_id/status",
    params(("payment_id" = Uuid, Path, description = "Payment ID")),
    request_body = UpdatePaymentStatusBody,
    responses(
        (status = 200, description = "Updated payment and order", body = crate::ApiResponse<crate::services::payments::PaymentWithOrder>),
        (status = 400, description = "Transition not allowed", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Payments"
)]
pub async fn update_payment_status(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(body): Json<UpdatePaymentStatusBody>,
) -> Result<Json<ApiResponse<PaymentWithOrder>>, ServiceError> {
    body.validate()?;
    let new_status = parse_status(&body.status)?;

    let updated = state
        .services
        .payments
        .update_status(payment_id, new_status, &user)
        .await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// Payment routes (authenticated; the webhook route lives outside this
/// router because the gateway authenticates by signature, not bearer token)
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_payments))
        .route("/stripe/create-intent", post(create_stripe_intent))
        .route("/stripe/confirm", post(confirm_stripe_payment))
        .route("/cash", post(process_cash_payment))
        .route("/order/:order_id", get(get_order_payments))
        .route("/user/:user_id", get(get_user_payments))
        .route("/:payment_id/status", put(update_payment_status))
}

fn parse_status(value: &str) -> Result<PaymentStatus, ServiceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::ValidationError(
            "status cannot be empty".to_string(),
        ));
    }
    PaymentStatus::from_str(&trimmed.to_ascii_lowercase()).map_err(|_| {
        ServiceError::InvalidStatus(format!("invalid payment status: {}", trimmed))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_accepts_the_full_taxonomy() {
        assert_eq!(parse_status("pending").unwrap(), PaymentStatus::Pending);
        assert_eq!(
            parse_status("requires_action").unwrap(),
            PaymentStatus::RequiresAction
        );
        assert_eq!(parse_status("COMPLETED").unwrap(), PaymentStatus::Completed);
        assert_eq!(parse_status("refunded").unwrap(), PaymentStatus::Refunded);
    }

    #[test]
    fn parse_status_rejects_junk() {
        assert!(parse_status("").is_err());
        assert!(parse_status("  ").is_err());
        assert!(parse_status("settled").is_err());
    }
}
