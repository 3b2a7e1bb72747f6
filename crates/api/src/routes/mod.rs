//! HTTP routes

pub mod billing;
pub mod tools;
pub mod webhooks;


use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/v1/account/balance", get(billing::get_balance))
        .route(
            "/v1/checkout/sessions",
            post(billing::create_checkout_session),
        )
        .route("/v1/tools/{tool}/quote", get(tools::quote_tool))
        .route("/v1/tools/{tool}/authorize", post(tools::authorize_tool))
        .route("/v1/tools/{tool}/usage", post(tools::record_usage))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/v1/webhooks/stripe", post(webhooks::stripe_webhook))
        .merge(authenticated)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let Some(pool) = &state.pool else {
        return (StatusCode::OK, Json(json!({ "status": "ok" })));
    };

    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok" })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check database ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "unreachable" })),
            )
        }
    }
}
