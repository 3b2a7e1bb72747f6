//! Paid tool usage
//!
//! A tool run is gated before it starts and settled after it finishes. Gating reads the
//! authoritative balance and refuses the run when it cannot be paid for. Settlement is
//! bookkeeping for work already delivered: a deduction that fails or times out is queued for
//! remediation instead of failing the run.

use std::sync::Arc;
use std::time::Duration;

use creditledger_shared::AccountStatus;
use serde::Serialize;

use crate::account::{AccountId, EntitlementMutation};
use crate::error::{BillingError, BillingResult};
use crate::ledger::EntitlementLedger;
use crate::store::{Catalog, DeductionBacklog, ToolConfig};

pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts after which a queued deduction is abandoned.
pub const MAX_BACKLOG_ATTEMPTS: i32 = 10;

const MAX_USAGE_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolQuote {
    pub tool: String,
    pub credit_cost: i64,
    pub ai_model: String,
    pub credits: i64,
    pub sufficient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Settlement {
    /// The deduction was applied; `credits` is the authoritative new balance.
    Deducted { credits: i64 },
    /// The deduction was queued and will be applied out of band.
    Deferred,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BacklogRunSummary {
    pub attempted: usize,
    pub settled: usize,
    pub failed: usize,
    pub abandoned: usize,
}

pub struct ToolUsageService {
    ledger: EntitlementLedger,
    catalog: Arc<dyn Catalog>,
    backlog: Arc<dyn DeductionBacklog>,
    settle_timeout: Duration,
}

impl ToolUsageService {
    pub fn new(
        ledger: EntitlementLedger,
        catalog: Arc<dyn Catalog>,
        backlog: Arc<dyn DeductionBacklog>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            backlog,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    async fn tool(&self, tool: &str) -> BillingResult<ToolConfig> {
        self.catalog
            .tool_config(tool)
            .await?
            .ok_or_else(|| BillingError::ToolNotFound(tool.to_string()))
    }

    /// Tool cost next to the account's current balance.
    pub async fn quote(&self, account_id: AccountId, tool: &str) -> BillingResult<ToolQuote> {
        let config = self.tool(tool).await?;
        let entitlement = self.ledger.balance(account_id).await?;

        Ok(ToolQuote {
            tool: config.tool_name,
            credit_cost: config.credit_cost,
            ai_model: config.ai_model,
            credits: entitlement.credits,
            sufficient: entitlement.credits >= config.credit_cost,
        })
    }

    /// Gate a tool run. Must be called before the paid action starts.
    pub async fn authorize(&self, account_id: AccountId, tool: &str) -> BillingResult<ToolQuote> {
        let config = self.tool(tool).await?;
        let entitlement = self.ledger.balance(account_id).await?;

        if entitlement.status == AccountStatus::Banned {
            return Err(BillingError::AccountBanned(account_id));
        }
        if entitlement.credits < config.credit_cost {
            tracing::debug!(
                account_id = %account_id,
                tool = %tool,
                required = config.credit_cost,
                available = entitlement.credits,
                "Tool run refused, insufficient credits"
            );
            return Err(BillingError::InsufficientCredits {
                required: config.credit_cost,
                available: entitlement.credits,
            });
        }

        Ok(ToolQuote {
            tool: config.tool_name,
            credit_cost: config.credit_cost,
            ai_model: config.ai_model,
            credits: entitlement.credits,
            sufficient: true,
        })
    }

    /// Charge a finished tool run.
    ///
    /// `usage_id` identifies the run; settling the same run twice charges once.
    pub async fn settle(
        &self,
        account_id: AccountId,
        tool: &str,
        usage_id: &str,
    ) -> BillingResult<Settlement> {
        let usage_id = usage_id.trim();
        if usage_id.is_empty() || usage_id.len() > MAX_USAGE_ID_LEN {
            return Err(BillingError::InvalidInput(format!(
                "usageId must be 1 to {} characters",
                MAX_USAGE_ID_LEN
            )));
        }

        let config = self.tool(tool).await?;
        let key = format!("usage:{}", usage_id);
        let mutation = EntitlementMutation::deduct(config.credit_cost).idempotency_key(key.clone());

        let failure = match tokio::time::timeout(
            self.settle_timeout,
            self.ledger.apply(account_id, mutation),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                return Ok(Settlement::Deducted {
                    credits: receipt.credits,
                })
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("deduction timed out after {:?}", self.settle_timeout),
        };

        tracing::warn!(
            account_id = %account_id,
            tool = %tool,
            usage_id = %usage_id,
            error = %failure,
            "Deduction after tool run failed, queued for remediation"
        );

        if let Err(e) = self
            .backlog
            .enqueue(account_id, tool, config.credit_cost, &key, &failure)
            .await
        {
            tracing::error!(
                account_id = %account_id,
                tool = %tool,
                usage_id = %usage_id,
                amount = config.credit_cost,
                error = %e,
                "Failed to queue deduction; charge is lost unless re-submitted"
            );
        }

        Ok(Settlement::Deferred)
    }

    /// Re-attempt up to `limit` queued deductions.
    pub async fn retry_backlog(&self, limit: i64) -> BillingResult<BacklogRunSummary> {
        let mut summary = BacklogRunSummary::default();

        for pending in self.backlog.due(limit).await? {
            summary.attempted += 1;
            let mutation = EntitlementMutation::deduct(pending.amount)
                .idempotency_key(pending.idempotency_key.clone());

            match self.ledger.apply(pending.account_id, mutation).await {
                Ok(receipt) => {
                    self.backlog.mark_done(pending.id).await?;
                    summary.settled += 1;
                    tracing::info!(
                        account_id = %pending.account_id,
                        tool = %pending.tool_name,
                        amount = pending.amount,
                        credits = receipt.credits,
                        "Queued deduction settled"
                    );
                }
                Err(e) => {
                    let abandon = pending.attempts + 1 >= MAX_BACKLOG_ATTEMPTS;
                    self.backlog
                        .record_failure(pending.id, &e.to_string(), abandon)
                        .await?;
                    if abandon {
                        summary.abandoned += 1;
                        tracing::error!(
                            account_id = %pending.account_id,
                            tool = %pending.tool_name,
                            amount = pending.amount,
                            idempotency_key = %pending.idempotency_key,
                            attempts = pending.attempts + 1,
                            error = %e,
                            "Abandoning queued deduction"
                        );
                    } else {
                        summary.failed += 1;
                    }
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::store::{BacklogStatus, InMemoryAccountStore, InMemoryBacklog, InMemoryCatalog};
    use uuid::Uuid;

    struct Fixture {
        service: ToolUsageService,
        store: Arc<InMemoryAccountStore>,
        backlog: Arc<InMemoryBacklog>,
        account_id: Uuid,
    }

    fn fixture(credits: i64) -> Fixture {
        let account_id = Uuid::new_v4();
        let mut account = Account::new(account_id, "writer@example.com");
        account.credits = credits;
        let store = Arc::new(InMemoryAccountStore::with_accounts([account]));
        let backlog = Arc::new(InMemoryBacklog::new());
        let catalog = InMemoryCatalog::new()
            .with_tool("blog-post", 20, "gpt-4o")
            .with_tool("headline", 10, "gpt-4o-mini");

        Fixture {
            service: ToolUsageService::new(
                EntitlementLedger::new(store.clone()),
                Arc::new(catalog),
                backlog.clone(),
            ),
            store,
            backlog,
            account_id,
        }
    }

    #[tokio::test]
    async fn quote_reports_sufficiency() {
        let f = fixture(15);
        let blog = f.service.quote(f.account_id, "blog-post").await.unwrap();
        assert_eq!(blog.credit_cost, 20);
        assert_eq!(blog.ai_model, "gpt-4o");
        assert!(!blog.sufficient);

        let headline = f.service.quote(f.account_id, "headline").await.unwrap();
        assert!(headline.sufficient);
    }

    #[tokio::test]
    async fn authorize_refuses_before_the_run() {
        let f = fixture(5);
        let err = f
            .service
            .authorize(f.account_id, "headline")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits {
                required: 10,
                available: 5
            }
        ));
        assert_eq!(f.store.get(f.account_id).unwrap().credits, 5);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let f = fixture(100);
        assert!(matches!(
            f.service.quote(f.account_id, "nope").await,
            Err(BillingError::ToolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn settle_returns_authoritative_balance_once_per_usage() {
        let f = fixture(50);
        let first = f
            .service
            .settle(f.account_id, "blog-post", "run-1")
            .await
            .unwrap();
        assert_eq!(first, Settlement::Deducted { credits: 30 });

        let again = f
            .service
            .settle(f.account_id, "blog-post", "run-1")
            .await
            .unwrap();
        assert_eq!(again, Settlement::Deducted { credits: 30 });
        assert_eq!(f.store.get(f.account_id).unwrap().credits, 30);
    }

    #[tokio::test]
    async fn failed_settlement_is_deferred_then_retried() {
        let f = fixture(50);
        f.store.fail_next_writes(1);

        let settlement = f
            .service
            .settle(f.account_id, "blog-post", "run-2")
            .await
            .unwrap();
        assert_eq!(settlement, Settlement::Deferred);
        assert_eq!(f.store.get(f.account_id).unwrap().credits, 50);
        assert_eq!(f.backlog.snapshot().len(), 1);

        let summary = f.service.retry_backlog(10).await.unwrap();
        assert_eq!(summary.settled, 1);
        assert_eq!(f.store.get(f.account_id).unwrap().credits, 30);
        assert_eq!(f.backlog.snapshot()[0].1, BacklogStatus::Done);
    }

    #[tokio::test]
    async fn backlog_entry_is_abandoned_after_max_attempts() {
        let f = fixture(0);
        let settlement = f
            .service
            .settle(f.account_id, "headline", "run-3")
            .await
            .unwrap();
        assert_eq!(settlement, Settlement::Deferred);

        for _ in 0..MAX_BACKLOG_ATTEMPTS {
            f.service.retry_backlog(10).await.unwrap();
        }

        let (entry, status) = f.backlog.snapshot().remove(0);
        assert_eq!(status, BacklogStatus::Abandoned);
        assert_eq!(entry.attempts, MAX_BACKLOG_ATTEMPTS);
        assert_eq!(f.store.get(f.account_id).unwrap().credits, 0);
    }

    #[tokio::test]
    async fn blank_usage_id_is_rejected() {
        let f = fixture(50);
        assert!(matches!(
            f.service.settle(f.account_id, "blog-post", "  ").await,
            Err(BillingError::InvalidInput(_))
        ));
    }
}
