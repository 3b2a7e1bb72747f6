//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use creditledger_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    /// A webhook that must be redelivered by the sender.
    #[error("Webhook processing failed: {0}")]
    WebhookRetry(BillingError),

    #[error("Webhook event is already being processed")]
    WebhookInFlight,

    #[error("Missing Stripe-Signature header")]
    MissingSignature,

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(err) => billing_status(err),
            ApiError::WebhookRetry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::WebhookInFlight => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::MissingSignature | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Billing(err) | ApiError::WebhookRetry(err) => err.code(),
            ApiError::WebhookInFlight => "event_in_flight",
            ApiError::MissingSignature => "missing_signature",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::InvalidSignature
        | BillingError::InvalidInput(_)
        | BillingError::MalformedEventMetadata(_) => StatusCode::BAD_REQUEST,
        BillingError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        BillingError::AccountBanned(_) => StatusCode::FORBIDDEN,
        BillingError::AccountNotFound(_)
        | BillingError::PlanNotFound(_)
        | BillingError::ToolNotFound(_) => StatusCode::NOT_FOUND,
        BillingError::ConcurrentUpdateConflict(_) => StatusCode::CONFLICT,
        BillingError::TransientStoreFailure(_) | BillingError::PricingNotConfigured => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BillingError::StripeApi(_) => StatusCode::BAD_GATEWAY,
        BillingError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable".to_string(),
                StatusCode::BAD_GATEWAY => "Payment provider error".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": message,
            "code": self.code(),
        });
        if let ApiError::Billing(BillingError::InsufficientCredits {
            required,
            available,
        }) = &self
        {
            body["required"] = json!(required);
            body["available"] = json!(available);
        }

        (status, Json(body)).into_response()
    }
}
