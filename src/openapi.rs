use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront API

Backend for a retail storefront: order management, card and cash payment
processing through an external gateway, idempotent webhook ingestion, and
order/payment reconciliation.

## Authentication

All endpoints except the payment webhook require a JWT bearer token:

```
Authorization: Bearer <your-jwt-token>
```

The webhook endpoint authenticates the gateway through its signature header
instead.

## Error Handling

Errors use a consistent response format with appropriate HTTP status codes:

```json
{
  "error": "Bad Request",
  "message": "Amount mismatch: expected 1000, got 900",
  "request_id": "req-abc123",
  "timestamp": "2025-01-01T00:00:00Z"
}
```
        "#,
        contact(
            name = "Storefront Engineering",
            email = "eng@storefront.dev"
        ),
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080/api/v1", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Order management endpoints"),
        (name = "Payments", description = "Payment processing endpoints"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Orders
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::get_order_items,
        crate::handlers::orders::my_orders,
        crate::handlers::orders::create_order,
        crate::handlers::orders::update_order_status,

        // Payments
        crate::handlers::payments::create_stripe_intent,
        crate::handlers::payments::confirm_stripe_payment,
        crate::handlers::payments::process_cash_payment,
        crate::handlers::payments::get_order_payments,
        crate::handlers::payments::get_user_payments,
        crate::handlers::payments::list_payments,
        crate::handlers::payments::update_payment_status,

        // Webhooks
        crate::handlers::payment_webhooks::stripe_webhook,
    ),
    components(
        schemas(
            // Common types
            crate::ApiResponse<serde_json::Value>,
            crate::PaginatedResponse<serde_json::Value>,
            crate::handlers::common::PaginationParams,

            // Order types
            crate::entities::order::Model,
            crate::entities::order::OrderStatus,
            crate::entities::order_item::Model,
            crate::handlers::orders::OrderListResponse,
            crate::services::orders::CreateOrderRequest,
            crate::services::orders::UpdateOrderStatusRequest,
            crate::services::orders::OrderItemInput,
            crate::services::orders::Address,
            crate::services::reconciliation::ValidatedOrder,
            crate::services::reconciliation::PaymentValidation,
            crate::services::reconciliation::ValidationCode,

            // Payment types
            crate::entities::payment::Model,
            crate::entities::payment::PaymentStatus,
            crate::entities::payment::PaymentMethod,
            crate::handlers::payments::CreateIntentBody,
            crate::handlers::payments::ConfirmIntentBody,
            crate::handlers::payments::CashPaymentBody,
            crate::handlers::payments::UpdatePaymentStatusBody,
            crate::services::payments::IntentCreated,
            crate::services::payments::PaymentWithOrder,

            // Error types
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_generates() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Storefront API"));
        assert!(json.contains("/api/v1/payments/stripe/create-intent"));
        assert!(json.contains("/api/v1/payments/stripe/webhook"));
    }
}
