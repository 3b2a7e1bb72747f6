//! Checkout and balance endpoints

use axum::{extract::State, Extension, Json};
use creditledger_billing::{CheckoutRequest, CheckoutResponse, Entitlement};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Start a hosted checkout for the caller.
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let response = state
        .billing
        .checkout
        .create_session(user.account_id, request)
        .await?;
    Ok(Json(response))
}

/// Authoritative balance, subscription and status of the caller's account.
pub async fn get_balance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Entitlement>> {
    Ok(Json(state.billing.ledger.balance(user.account_id).await?))
}
