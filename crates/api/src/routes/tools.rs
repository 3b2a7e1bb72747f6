//! Paid tool gating and settlement
//!
//! Clients call `authorize` before running a tool and `usage` after it succeeds. Balances
//! returned here are read from the ledger, never from client state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use creditledger_billing::{Settlement, ToolQuote};
use serde::Deserialize;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRequest {
    /// Client-generated id of the tool run; repeating it charges once.
    pub usage_id: String,
}

pub async fn quote_tool(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(tool): Path<String>,
) -> ApiResult<Json<ToolQuote>> {
    Ok(Json(state.billing.tools.quote(user.account_id, &tool).await?))
}

/// 402 with `required`/`available` when the run cannot be paid for.
pub async fn authorize_tool(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(tool): Path<String>,
) -> ApiResult<Json<ToolQuote>> {
    Ok(Json(
        state.billing.tools.authorize(user.account_id, &tool).await?,
    ))
}

pub async fn record_usage(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(tool): Path<String>,
    Json(request): Json<UsageRequest>,
) -> ApiResult<(StatusCode, Json<Settlement>)> {
    let settlement = state
        .billing
        .tools
        .settle(user.account_id, &tool, &request.usage_id)
        .await?;

    let status = match settlement {
        Settlement::Deducted { .. } => StatusCode::OK,
        Settlement::Deferred => StatusCode::ACCEPTED,
    };
    Ok((status, Json(settlement)))
}
