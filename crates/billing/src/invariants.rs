//! Ledger invariant checks
//!
//! Read-only SQL checks that the worker runs on a schedule. Each check reports the accounts
//! or records that break one invariant, with enough context to investigate.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::PROCESSING_TIMEOUT_MINUTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub account_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Balances may be wrong
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceDriftRow {
    account_id: Uuid,
    credits: i64,
    ledger_balance: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CancelledActiveRow {
    account_id: Uuid,
    email: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanLabelRow {
    account_id: Uuid,
    subscription: Option<String>,
    plan_name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    stripe_event_id: String,
    event_type: String,
    processing_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct AbandonedDeductionRow {
    account_id: Uuid,
    tool_name: String,
    amount: i64,
    idempotency_key: String,
    last_error: Option<String>,
}

const CHECKS: [&str; 5] = [
    "balance_matches_ledger",
    "cancelled_is_inactive",
    "subscription_label_matches_plan",
    "no_stuck_webhook_events",
    "no_abandoned_deductions",
];

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }
        Ok(InvariantCheckSummary::from_violations(
            CHECKS.len(),
            violations,
        ))
    }

    /// Run one check by name; unknown names report nothing.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "balance_matches_ledger" => self.check_balance_matches_ledger().await,
            "cancelled_is_inactive" => self.check_cancelled_is_inactive().await,
            "subscription_label_matches_plan" => self.check_subscription_label().await,
            "no_stuck_webhook_events" => self.check_stuck_webhook_events().await,
            "no_abandoned_deductions" => self.check_abandoned_deductions().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// The stored balance equals `balance_after` of the account's latest ledger entry.
    async fn check_balance_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceDriftRow> = sqlx::query_as(
            r#"
            SELECT u.id AS account_id, u.credits, latest.balance_after AS ledger_balance
            FROM users u
            JOIN LATERAL (
                SELECT balance_after
                FROM credit_ledger_entries e
                WHERE e.account_id = u.id
                ORDER BY e.account_version DESC
                LIMIT 1
            ) latest ON TRUE
            WHERE u.credits <> latest.balance_after
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "balance_matches_ledger".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account holds {} credits but its latest ledger entry says {}",
                    row.credits, row.ledger_balance
                ),
                context: serde_json::json!({
                    "credits": row.credits,
                    "ledger_balance": row.ledger_balance,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Cancelled subscriptions leave the account inactive.
    async fn check_cancelled_is_inactive(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelledActiveRow> = sqlx::query_as(
            r#"
            SELECT id AS account_id, email
            FROM users
            WHERE subscription = 'Cancelled' AND status = 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_is_inactive".to_string(),
                account_ids: vec![row.account_id],
                description: format!("Account '{}' is cancelled but still active", row.email),
                context: serde_json::json!({ "email": row.email }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_subscription_label(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanLabelRow> = sqlx::query_as(
            r#"
            SELECT u.id AS account_id, u.subscription, p.name AS plan_name
            FROM users u
            JOIN subscription_plans p ON p.id = u.subscription_plan_id
            WHERE u.subscription IS DISTINCT FROM p.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_label_matches_plan".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Subscription label '{}' differs from plan name '{}'",
                    row.subscription.as_deref().unwrap_or("(none)"),
                    row.plan_name
                ),
                context: serde_json::json!({
                    "subscription": row.subscription,
                    "plan_name": row.plan_name,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    async fn check_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT stripe_event_id, event_type, processing_started_at
            FROM stripe_webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - make_interval(mins => $1)
            "#,
        )
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                account_ids: vec![],
                description: format!(
                    "Webhook event {} ({}) has been processing for over {} minutes",
                    row.stripe_event_id, row.event_type, PROCESSING_TIMEOUT_MINUTES
                ),
                context: serde_json::json!({
                    "stripe_event_id": row.stripe_event_id,
                    "event_type": row.event_type,
                    "processing_started_at": row.processing_started_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_abandoned_deductions(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AbandonedDeductionRow> = sqlx::query_as(
            r#"
            SELECT account_id, tool_name, amount, idempotency_key, last_error
            FROM deduction_backlog
            WHERE status = 'abandoned'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_abandoned_deductions".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Deduction of {} credits for '{}' was never applied",
                    row.amount, row.tool_name
                ),
                context: serde_json::json!({
                    "tool_name": row.tool_name,
                    "amount": row.amount,
                    "idempotency_key": row.idempotency_key,
                    "last_error": row.last_error,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
