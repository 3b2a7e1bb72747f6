//! Stripe webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use creditledger_billing::WebhookOutcome;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Receive a Stripe event.
///
/// 2xx acknowledges the event, including events that were skipped. 4xx means the delivery
/// was not authentic. 5xx asks Stripe to redeliver.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::MissingSignature)?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::BadRequest("Webhook payload is not UTF-8".to_string()))?;

    let event = state
        .billing
        .webhooks
        .verify_event(payload, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected Stripe webhook delivery");
            e
        })?;
    let event_id = event.id.clone();

    match state.billing.webhooks.handle_event(event).await {
        Ok(WebhookOutcome::InFlight) => Err(ApiError::WebhookInFlight),
        Ok(outcome) => Ok(Json(json!({
            "received": true,
            "eventId": event_id,
            "outcome": outcome.as_str(),
        }))),
        Err(e) => Err(ApiError::WebhookRetry(e)),
    }
}
