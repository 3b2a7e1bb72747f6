#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Creditledger Background Worker
//!
//! Handles scheduled jobs including:
//! - Remediation of tool deductions that could not be applied (every 5 minutes)
//! - Ledger invariant checks (hourly)
//! - Failed webhook event report (hourly)
//! - Webhook event log pruning (daily at 3:30 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use creditledger_billing::{BillingService, InvariantChecker, ViolationSeverity};
use creditledger_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_RETENTION_DAYS: i64 = 30;
const DEFAULT_BACKLOG_BATCH: i64 = 100;

fn env_i64(name: &str, default: i64) -> i64 {
    parse_positive(std::env::var(name).ok().as_deref()).unwrap_or_else(|| {
        if std::env::var(name).is_ok() {
            warn!(name = name, default = default, "Ignoring invalid value, using default");
        }
        default
    })
}

fn parse_positive(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Creditledger Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool.clone())?);
    let checker = Arc::new(InvariantChecker::new(pool));

    let retention_days = env_i64("WEBHOOK_EVENT_RETENTION_DAYS", DEFAULT_RETENTION_DAYS);
    let backlog_batch = env_i64("DEDUCTION_BACKLOG_BATCH", DEFAULT_BACKLOG_BATCH);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Retry queued tool deductions
    let backlog_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = backlog_billing.clone();
            Box::pin(async move {
                match billing.tools.retry_backlog(backlog_batch).await {
                    Ok(summary) if summary.attempted > 0 => info!(
                        attempted = summary.attempted,
                        settled = summary.settled,
                        failed = summary.failed,
                        abandoned = summary.abandoned,
                        "Deduction backlog pass complete"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Deduction backlog pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Deduction backlog remediation (every 5 minutes)");

    // Job 2: Ledger invariant checks
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => info!(
                        checks_run = summary.checks_run,
                        "Ledger invariants hold"
                    ),
                    Ok(summary) => {
                        for violation in &summary.violations {
                            let account_ids = format!("{:?}", violation.account_ids);
                            match violation.severity {
                                ViolationSeverity::Critical | ViolationSeverity::High => error!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    account_ids = %account_ids,
                                    "{}",
                                    violation.description
                                ),
                                _ => warn!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    account_ids = %account_ids,
                                    "{}",
                                    violation.description
                                ),
                            }
                        }
                        warn!(
                            checks_run = summary.checks_run,
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Ledger invariant violations found"
                        );
                    }
                    Err(e) => error!(error = %e, "Ledger invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (hourly)");

    // Job 3: Report webhook events whose last attempt failed
    let failed_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let billing = failed_billing.clone();
            Box::pin(async move {
                match billing.webhooks.failed_events(50).await {
                    Ok(events) if events.is_empty() => {}
                    Ok(events) => {
                        for event in &events {
                            warn!(
                                event_id = %event.stripe_event_id,
                                event_type = %event.event_type,
                                error = ?event.error_message,
                                "Webhook event awaiting redelivery"
                            );
                        }
                        warn!(count = events.len(), "Webhook events in error state");
                    }
                    Err(e) => error!(error = %e, "Failed to list failed webhook events"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed webhook event report (hourly)");

    // Job 4: Prune the webhook event log
    let prune_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let billing = prune_billing.clone();
            Box::pin(async move {
                if let Err(e) = billing.webhooks.prune_events(retention_days).await {
                    error!(error = %e, "Webhook event pruning failed");
                }
            })
        })?)
        .await?;
    info!(
        retention_days = retention_days,
        "Scheduled: Webhook event pruning (daily at 3:30 AM UTC)"
    );

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Creditledger Worker started successfully with {} scheduled jobs", 4);

    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_values_parse() {
        assert_eq!(parse_positive(Some("45")), Some(45));
        assert_eq!(parse_positive(Some(" 7 ")), Some(7));
    }

    #[test]
    fn invalid_values_fall_back() {
        assert_eq!(parse_positive(None), None);
        assert_eq!(parse_positive(Some("0")), None);
        assert_eq!(parse_positive(Some("-3")), None);
        assert_eq!(parse_positive(Some("thirty")), None);
    }
}
