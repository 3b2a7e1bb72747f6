//! Persistence seams for the ledger, the webhook event log, the catalog and the
//! deduction backlog.
//!
//! Each seam has a Postgres implementation used in production and an in-memory
//! implementation used by tests and local tooling.

mod memory;
mod postgres;

use async_trait::async_trait;
use creditledger_shared::BillingCycle;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::{Account, AccountId, EntitlementMutation, EventOrdering, LedgerEntry};
use crate::error::BillingResult;

pub use memory::{
    BacklogStatus, InMemoryAccountStore, InMemoryBacklog, InMemoryCatalog, InMemoryEventLog,
};
pub use postgres::{PgAccountStore, PgBacklog, PgCatalog, PgEventLog};

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Account),
    /// Another writer changed the row since it was loaded.
    VersionMismatch,
    /// The mutation's idempotency key was already applied; carries the current row.
    DuplicateKey(Account),
    /// The subscription already moved past the event; carries the current row.
    Stale(Account),
}

/// Result of a single-statement atomic mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicOutcome {
    Applied(Account),
    NotFound,
    Insufficient { available: i64 },
    /// Credit would overflow the balance.
    Overflow,
    Duplicate(Account),
    Stale(Account),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load(&self, account_id: AccountId) -> BillingResult<Option<Account>>;

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>>;

    async fn has_idempotency_key(&self, key: &str) -> BillingResult<bool>;

    /// Latest event applied for a billing subscription.
    async fn watermark(&self, subscription_id: &str) -> BillingResult<Option<Watermark>>;

    /// Write `next` only if the stored row is still at `expected_version`.
    ///
    /// With `ordering`, the subscription watermark is checked and advanced in the same write;
    /// a stale event leaves both the row and the watermark untouched.
    async fn commit(
        &self,
        account_id: AccountId,
        expected_version: i64,
        next: &Account,
        entry: &LedgerEntry,
        ordering: Option<&EventOrdering>,
    ) -> BillingResult<CommitOutcome>;

    /// Apply `mutation` against the current stored value in one transaction, including its
    /// ordering guard.
    ///
    /// Stores that cannot express arithmetic updates atomically return `None`; the ledger
    /// then falls back to a compare-and-swap loop.
    async fn apply_atomic(
        &self,
        _account_id: AccountId,
        _mutation: &EntitlementMutation,
    ) -> BillingResult<Option<AtomicOutcome>> {
        Ok(None)
    }
}

/// Whether a webhook event may be processed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyProcessed,
    /// Another worker holds the claim and has not finished yet.
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingResult {
    Success,
    Dropped,
    Error,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Success => "success",
            ProcessingResult::Dropped => "dropped",
            ProcessingResult::Error => "error",
        }
    }
}

/// Latest event applied for one billing subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub last_event_at: OffsetDateTime,
    /// Set once the subscription has been deleted.
    pub terminal: bool,
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Minutes after which a claim stuck in `processing` may be taken over.
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome>;

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Delete finished records created before `older_than`.
    async fn prune(&self, older_than: OffsetDateTime) -> BillingResult<u64>;
}

/// Static catalog entry for a subscription plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    /// Credits granted per billing period.
    pub credits: i64,
    pub price_cents: i64,
    pub stripe_price_id: String,
    pub billing_cycle: BillingCycle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditPricing {
    pub price_per_credit_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolConfig {
    pub tool_name: String,
    pub credit_cost: i64,
    pub ai_model: String,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn plan_by_id(&self, plan_id: Uuid) -> BillingResult<Option<SubscriptionPlan>>;

    async fn plan_by_price_id(&self, price_id: &str) -> BillingResult<Option<SubscriptionPlan>>;

    async fn plan_by_name(&self, name: &str) -> BillingResult<Option<SubscriptionPlan>>;

    async fn credit_pricing(&self) -> BillingResult<Option<CreditPricing>>;

    async fn tool_config(&self, tool_name: &str) -> BillingResult<Option<ToolConfig>>;
}

/// A deduction that could not be applied when the paid action finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PendingDeduction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub tool_name: String,
    pub amount: i64,
    pub idempotency_key: String,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait DeductionBacklog: Send + Sync {
    /// Queue a deduction; a second enqueue with the same key is a no-op.
    async fn enqueue(
        &self,
        account_id: AccountId,
        tool_name: &str,
        amount: i64,
        idempotency_key: &str,
        error: &str,
    ) -> BillingResult<()>;

    async fn due(&self, limit: i64) -> BillingResult<Vec<PendingDeduction>>;

    async fn mark_done(&self, id: Uuid) -> BillingResult<()>;

    async fn record_failure(&self, id: Uuid, error: &str, abandon: bool) -> BillingResult<()>;
}
