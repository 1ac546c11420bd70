use super::common::PaginationParams;
use crate::auth::AuthenticatedUser;
use crate::entities::{order, order_item};
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::orders::{CreateOrderRequest, UpdateOrderStatusRequest};
use crate::services::reconciliation::ValidatedOrder;
use crate::ApiResponse;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Router,
};
use utoipa::ToSchema;
use uuid::Uuid;

/// An order returned together with its validation annotation.
#[derive(serde::Serialize, ToSchema)]
pub struct OrderListResponse {
    pub orders: Vec<ValidatedOrder>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Create a new order
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = crate::ApiResponse<crate::entities::order::Model>),
        (status = 400, description = "Validation failure", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<order::Model>>), ServiceError> {
    let order = state.services.orders.create_order(request, &user).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}

/// Get an order by id (owner or admin)
#[utoipa::path(
    get,
    path = "/api/v1/orders/:id",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order", body = crate::ApiResponse<crate::entities::order::Model>),
        (status = 403, description = "Not the owner", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    let order = state.services.orders.get_order(id, &user).await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Get an order's line items (owner or admin)
#[utoipa::path(
    get,
    path = "/api/v1/orders/:id/items",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Line items", body = crate::ApiResponse<Vec<crate::entities::order_item::Model>>),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn get_order_items(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthenticatedUser,
) -> Result<Json<ApiResponse<Vec<order_item::Model>>>, ServiceError> {
    let items = state.services.orders.get_order_items(id, &user).await?;
    Ok(Json(ApiResponse::success(items)))
}

/// The requesting buyer's orders, with inconsistent payment pairs hidden
#[utoipa::path(
    get,
    path = "/api/v1/orders/my",
    responses(
        (status = 200, description = "Own orders", body = crate::ApiResponse<Vec<crate::entities::order::Model>>)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn my_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<ApiResponse<Vec<order::Model>>>, ServiceError> {
    let orders = state.services.orders.my_orders(&user).await?;
    Ok(Json(ApiResponse::success(orders)))
}

/// List all orders with payment validation annotations (admin)
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(PaginationParams),
    responses(
        (status = 200, description = "Annotated orders", body = crate::ApiResponse<OrderListResponse>),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
    user: AuthenticatedUser,
) -> Result<Json<ApiResponse<OrderListResponse>>, ServiceError> {
    let (orders, total) = state
        .services
        .orders
        .list_orders(params.page, params.per_page, &user)
        .await?;
    Ok(Json(ApiResponse::success(OrderListResponse {
        orders,
        total,
        page: params.page,
        per_page: params.per_page,
    })))
}

/// Update an order's fulfillment status (supplier or admin)
#[utoipa::path(
    put,
    path = "/api/v1/orders/:id/status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Updated order", body = crate::ApiResponse<crate::entities::order::Model>),
        (status = 400, description = "Invalid status", body = crate::errors::ErrorResponse),
        (status = 403, description = "Supplier or admin only", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "Orders"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> Result<Json<ApiResponse<order::Model>>, ServiceError> {
    let order = state
        .services
        .orders
        .update_order_status(id, request, &user)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

/// Order routes
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order).get(list_orders))
        .route("/my", get(my_orders))
        .route("/:id", get(get_order))
        .route("/:id/items", get(get_order_items))
        .route("/:id/status", put(update_order_status))
}
