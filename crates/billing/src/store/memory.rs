//! In-memory store implementations

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{
    AccountStore, Catalog, ClaimOutcome, CommitOutcome, CreditPricing, DeductionBacklog,
    EventLog, PendingDeduction, ProcessingResult, SubscriptionPlan, ToolConfig, Watermark,
    WebhookEventRecord, PROCESSING_TIMEOUT_MINUTES,
};
use crate::account::{Account, AccountId, EventOrdering, LedgerEntry};
use crate::error::{BillingError, BillingResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct AccountTable {
    accounts: HashMap<AccountId, Account>,
    applied_keys: HashSet<String>,
    entries: Vec<LedgerEntry>,
    watermarks: HashMap<String, Watermark>,
}

/// Versioned account rows and subscription watermarks behind one mutex.
///
/// Only compare-and-swap writes are supported, so the ledger's optimistic retry loop is what
/// keeps concurrent writers from losing updates.
#[derive(Default)]
pub struct InMemoryAccountStore {
    table: Mutex<AccountTable>,
    failing_writes: AtomicUsize,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let store = Self::new();
        for account in accounts {
            store.insert(account);
        }
        store
    }

    pub fn insert(&self, account: Account) {
        lock(&self.table).accounts.insert(account.id, account);
    }

    pub fn get(&self, account_id: AccountId) -> Option<Account> {
        lock(&self.table).accounts.get(&account_id).cloned()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        lock(&self.table).entries.clone()
    }

    /// Make the next `count` writes fail with `TransientStoreFailure`.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn load(&self, account_id: AccountId) -> BillingResult<Option<Account>> {
        Ok(self.get(account_id))
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        Ok(lock(&self.table)
            .accounts
            .values()
            .find(|a| a.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn has_idempotency_key(&self, key: &str) -> BillingResult<bool> {
        Ok(lock(&self.table).applied_keys.contains(key))
    }

    async fn watermark(&self, subscription_id: &str) -> BillingResult<Option<Watermark>> {
        Ok(lock(&self.table).watermarks.get(subscription_id).copied())
    }

    async fn commit(
        &self,
        account_id: AccountId,
        expected_version: i64,
        next: &Account,
        entry: &LedgerEntry,
        ordering: Option<&EventOrdering>,
    ) -> BillingResult<CommitOutcome> {
        if self.take_injected_failure() {
            return Err(BillingError::TransientStoreFailure(
                "injected write failure".to_string(),
            ));
        }

        let mut table = lock(&self.table);
        let current = table
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or(BillingError::AccountNotFound(account_id))?;

        if let Some(key) = &entry.idempotency_key {
            if table.applied_keys.contains(key) {
                return Ok(CommitOutcome::DuplicateKey(current));
            }
        }
        if let Some(ordering) = ordering {
            if ordering.is_stale(table.watermarks.get(&ordering.subscription_id)) {
                return Ok(CommitOutcome::Stale(current));
            }
        }
        if current.version != expected_version {
            return Ok(CommitOutcome::VersionMismatch);
        }

        if let Some(ordering) = ordering {
            let advanced = ordering.advance(table.watermarks.get(&ordering.subscription_id));
            table
                .watermarks
                .insert(ordering.subscription_id.clone(), advanced);
        }
        if let Some(key) = &entry.idempotency_key {
            table.applied_keys.insert(key.clone());
        }
        table.entries.push(entry.clone());
        table.accounts.insert(account_id, next.clone());
        Ok(CommitOutcome::Committed(next.clone()))
    }
}

struct EventRow {
    record: WebhookEventRecord,
}

#[derive(Default)]
struct EventTable {
    events: HashMap<String, EventRow>,
}

#[derive(Default)]
pub struct InMemoryEventLog {
    table: Mutex<EventTable>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, event_id: &str) -> Option<String> {
        lock(&self.table)
            .events
            .get(event_id)
            .map(|row| row.record.processing_result.clone())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut table = lock(&self.table);

        if let Some(row) = table.events.get_mut(event_id) {
            let stuck = row.record.processing_result == "processing"
                && row
                    .record
                    .processing_started_at
                    .is_some_and(|t| t < now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES));
            return Ok(match row.record.processing_result.as_str() {
                "error" => {
                    row.record.processing_result = "processing".to_string();
                    row.record.processing_started_at = Some(now);
                    ClaimOutcome::Claimed
                }
                "processing" if stuck => {
                    row.record.processing_started_at = Some(now);
                    row.record.error_message = Some(format!("Recovered from stuck state at {now}"));
                    ClaimOutcome::Claimed
                }
                "processing" => ClaimOutcome::InFlight,
                _ => ClaimOutcome::AlreadyProcessed,
            });
        }

        table.events.insert(
            event_id.to_string(),
            EventRow {
                record: WebhookEventRecord {
                    id: Uuid::new_v4(),
                    stripe_event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    event_timestamp: event_at,
                    processing_result: "processing".to_string(),
                    processing_started_at: Some(now),
                    error_message: None,
                    created_at: now,
                },
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(row) = lock(&self.table).events.get_mut(event_id) {
            row.record.processing_result = result.as_str().to_string();
            row.record.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let table = lock(&self.table);
        let mut failed: Vec<WebhookEventRecord> = table
            .events
            .values()
            .filter(|row| row.record.processing_result == "error")
            .map(|row| row.record.clone())
            .collect();
        failed.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        failed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(failed)
    }

    async fn prune(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let mut table = lock(&self.table);
        let before = table.events.len();
        table.events.retain(|_, row| {
            row.record.created_at >= older_than || row.record.processing_result == "processing"
        });
        Ok((before - table.events.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryCatalog {
    plans: Vec<SubscriptionPlan>,
    pricing: Option<CreditPricing>,
    tools: HashMap<String, ToolConfig>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: SubscriptionPlan) -> Self {
        self.plans.push(plan);
        self
    }

    pub fn with_pricing(mut self, price_per_credit_cents: i64) -> Self {
        self.pricing = Some(CreditPricing {
            price_per_credit_cents,
            currency: "usd".to_string(),
        });
        self
    }

    pub fn with_tool(mut self, tool_name: &str, credit_cost: i64, ai_model: &str) -> Self {
        self.tools.insert(
            tool_name.to_string(),
            ToolConfig {
                tool_name: tool_name.to_string(),
                credit_cost,
                ai_model: ai_model.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn plan_by_id(&self, plan_id: Uuid) -> BillingResult<Option<SubscriptionPlan>> {
        Ok(self.plans.iter().find(|p| p.id == plan_id).cloned())
    }

    async fn plan_by_price_id(&self, price_id: &str) -> BillingResult<Option<SubscriptionPlan>> {
        Ok(self
            .plans
            .iter()
            .find(|p| p.stripe_price_id == price_id)
            .cloned())
    }

    async fn plan_by_name(&self, name: &str) -> BillingResult<Option<SubscriptionPlan>> {
        Ok(self.plans.iter().find(|p| p.name == name).cloned())
    }

    async fn credit_pricing(&self) -> BillingResult<Option<CreditPricing>> {
        Ok(self.pricing.clone())
    }

    async fn tool_config(&self, tool_name: &str) -> BillingResult<Option<ToolConfig>> {
        Ok(self.tools.get(tool_name).cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogStatus {
    Pending,
    Done,
    Abandoned,
}

#[derive(Default)]
pub struct InMemoryBacklog {
    entries: Mutex<Vec<(PendingDeduction, BacklogStatus)>>,
}

impl InMemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<(PendingDeduction, BacklogStatus)> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl DeductionBacklog for InMemoryBacklog {
    async fn enqueue(
        &self,
        account_id: AccountId,
        tool_name: &str,
        amount: i64,
        idempotency_key: &str,
        error: &str,
    ) -> BillingResult<()> {
        let mut entries = lock(&self.entries);
        if entries
            .iter()
            .any(|(d, _)| d.idempotency_key == idempotency_key)
        {
            return Ok(());
        }
        entries.push((
            PendingDeduction {
                id: Uuid::new_v4(),
                account_id,
                tool_name: tool_name.to_string(),
                amount,
                idempotency_key: idempotency_key.to_string(),
                attempts: 0,
                last_error: Some(error.to_string()),
            },
            BacklogStatus::Pending,
        ));
        Ok(())
    }

    async fn due(&self, limit: i64) -> BillingResult<Vec<PendingDeduction>> {
        Ok(lock(&self.entries)
            .iter()
            .filter(|(_, status)| *status == BacklogStatus::Pending)
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|(d, _)| d.clone())
            .collect())
    }

    async fn mark_done(&self, id: Uuid) -> BillingResult<()> {
        for (d, status) in lock(&self.entries).iter_mut() {
            if d.id == id {
                *status = BacklogStatus::Done;
            }
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str, abandon: bool) -> BillingResult<()> {
        for (d, status) in lock(&self.entries).iter_mut() {
            if d.id == id {
                d.attempts += 1;
                d.last_error = Some(error.to_string());
                if abandon {
                    *status = BacklogStatus::Abandoned;
                }
            }
        }
        Ok(())
    }
}
