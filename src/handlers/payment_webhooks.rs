use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use serde_json::json;
use tracing::{info, warn};

use crate::errors::ServiceError;
use crate::services::payments::WebhookOutcome;
use crate::webhooks;
use crate::AppState;

// POST /api/v1/payments/stripe/webhook
//
// Unauthenticated route: the gateway proves itself through the signature
// header, never a bearer token. Once the signature verifies, nearly
// everything answers 200 so an unfixable data error doesn't trigger an
// infinite retry storm. Only a transient local failure (store unavailable)
// surfaces as 5xx.
#[utoipa::path(
    post,
    path = "/api/v1/payments/stripe/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Event applied or discarded"),
        (status = 400, description = "Signature verification failed", body = crate::errors::ErrorResponse),
        (status = 500, description = "Transient local failure; gateway should retry", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    // Verify before trusting any field of the payload.
    if let Some(secret) = state.config.payment_webhook_secret.as_deref() {
        let verified = webhooks::verify_signature(
            &headers,
            &body,
            secret,
            state.config.payment_webhook_tolerance_secs,
        );
        if !verified {
            warn!("payment webhook signature verification failed");
            return Err(ServiceError::InvalidSignature);
        }
    } else if state.config.is_production() {
        // A production deployment without a webhook secret cannot accept
        // events safely.
        warn!("payment webhook received but no webhook secret is configured");
        return Err(ServiceError::InvalidSignature);
    }

    let event = webhooks::parse_event(&body)?;
    let event_id = event.id.clone();
    let kind = event.kind.clone();

    let outcome = state
        .services
        .webhook_router
        .dispatch(&state.services.payments, event)
        .await?;

    match &outcome {
        WebhookOutcome::Applied { payment_id } => {
            info!(event_id = ?event_id, %kind, %payment_id, "webhook event applied");
        }
        WebhookOutcome::Discarded { reason } => {
            info!(event_id = ?event_id, %kind, %reason, "webhook event discarded");
        }
        WebhookOutcome::OrderMissing => {
            // Logged at the source; acknowledged so the gateway stops
            // retrying a data error it cannot fix.
        }
    }

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}
