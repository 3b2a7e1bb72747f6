//! Billing error types

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Concurrent update conflict on account {0}")]
    ConcurrentUpdateConflict(Uuid),

    #[error("Malformed event metadata: {0}")]
    MalformedEventMetadata(String),

    #[error("Transient store failure: {0}")]
    TransientStoreFailure(String),

    #[error("Account is banned: {0}")]
    AccountBanned(Uuid),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Credit pricing is not configured")]
    PricingNotConfigured,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether the payment processor should redeliver the event that produced this error.
    ///
    /// Signature and metadata failures are terminal for an event; anything that could
    /// succeed on a later attempt is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::AccountNotFound(_)
                | BillingError::ConcurrentUpdateConflict(_)
                | BillingError::TransientStoreFailure(_)
                | BillingError::StripeApi(_)
        )
    }

    /// Short machine-readable code, used in API error bodies and audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::AccountNotFound(_) => "account_not_found",
            BillingError::InsufficientCredits { .. } => "insufficient_credits",
            BillingError::InvalidSignature => "invalid_signature",
            BillingError::ConcurrentUpdateConflict(_) => "concurrent_update_conflict",
            BillingError::MalformedEventMetadata(_) => "malformed_event_metadata",
            BillingError::TransientStoreFailure(_) => "transient_store_failure",
            BillingError::AccountBanned(_) => "account_banned",
            BillingError::PlanNotFound(_) => "plan_not_found",
            BillingError::ToolNotFound(_) => "tool_not_found",
            BillingError::PricingNotConfigured => "pricing_not_configured",
            BillingError::InvalidInput(_) => "invalid_input",
            BillingError::StripeApi(_) => "stripe_api_error",
            BillingError::Config(_) => "config_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::TransientStoreFailure(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BillingError::AccountNotFound(Uuid::nil()).is_retryable());
        assert!(BillingError::ConcurrentUpdateConflict(Uuid::nil()).is_retryable());
        assert!(BillingError::TransientStoreFailure("down".into()).is_retryable());

        assert!(!BillingError::InvalidSignature.is_retryable());
        assert!(!BillingError::MalformedEventMetadata("no account_id".into()).is_retryable());
        assert!(!BillingError::InsufficientCredits {
            required: 10,
            available: 5
        }
        .is_retryable());
    }

    #[test]
    fn insufficient_credits_message_carries_amounts() {
        let err = BillingError::InsufficientCredits {
            required: 10,
            available: 5,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient credits: required 10, available 5"
        );
        assert_eq!(err.code(), "insufficient_credits");
    }
}
