//! Application state

use std::sync::Arc;

use creditledger_billing::{BillingResult, BillingService};
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Absent when the state is assembled without a database (tests, local tooling).
    pub pool: Option<PgPool>,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config) -> BillingResult<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Stripe billing service initialized");

        Ok(Self {
            pool: Some(pool),
            jwt_manager: JwtManager::new(&config.supabase_jwt_secret),
            billing: Arc::new(billing),
        })
    }

    pub fn with_billing(billing: BillingService, jwt_manager: JwtManager) -> Self {
        Self {
            pool: None,
            jwt_manager,
            billing: Arc::new(billing),
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
