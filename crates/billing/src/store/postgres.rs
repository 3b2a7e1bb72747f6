//! Postgres store implementations

use async_trait::async_trait;
use creditledger_shared::{AccountLevel, AccountStatus, BillingCycle};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    AccountStore, AtomicOutcome, Catalog, ClaimOutcome, CommitOutcome, CreditPricing,
    DeductionBacklog, EventLog, PendingDeduction, ProcessingResult, SubscriptionPlan, ToolConfig,
    Watermark, WebhookEventRecord, PROCESSING_TIMEOUT_MINUTES,
};
use crate::account::{
    Account, AccountId, CreditChange, EntitlementMutation, EventOrdering, LedgerEntry,
    SubscriptionState,
};
use crate::error::{BillingError, BillingResult};

const ACCOUNT_COLUMNS: &str = "id, email, display_name, credits, subscription, \
     subscription_plan_id, status, stripe_customer_id, account_level, last_login, version";

/// Row type for `users`
#[derive(Debug, FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    display_name: Option<String>,
    credits: i64,
    subscription: Option<String>,
    subscription_plan_id: Option<Uuid>,
    status: String,
    stripe_customer_id: Option<String>,
    account_level: String,
    last_login: Option<OffsetDateTime>,
    version: i64,
}

impl TryFrom<AccountRow> for Account {
    type Error = BillingError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let status: AccountStatus = row
            .status
            .parse()
            .map_err(|e| BillingError::TransientStoreFailure(format!("users.status: {}", e)))?;
        let account_level: AccountLevel = row.account_level.parse().map_err(|e| {
            BillingError::TransientStoreFailure(format!("users.account_level: {}", e))
        })?;

        Ok(Account {
            id: row.id,
            email: row.email,
            display_name: row.display_name,
            credits: row.credits,
            subscription: SubscriptionState::from_columns(
                row.subscription,
                row.subscription_plan_id,
            ),
            status,
            stripe_customer_id: row.stripe_customer_id,
            account_level,
            last_login: row.last_login,
            version: row.version,
        })
    }
}

/// Row returned by the atomic update, carrying the balance before the write.
#[derive(Debug, FromRow)]
struct AppliedRow {
    #[sqlx(flatten)]
    account: AccountRow,
    previous_credits: i64,
}

fn credit_op(change: CreditChange) -> &'static str {
    match change {
        CreditChange::Unchanged => "keep",
        CreditChange::Add(_) => "add",
        CreditChange::Subtract(_) => "subtract",
        CreditChange::Set(_) => "set",
    }
}

async fn insert_ledger_entry(
    tx: &mut Transaction<'_, Postgres>,
    entry: &LedgerEntry,
) -> Result<bool, sqlx::Error> {
    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO credit_ledger_entries
            (account_id, idempotency_key, kind, delta, balance_after, account_version)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (idempotency_key) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(entry.account_id)
    .bind(&entry.idempotency_key)
    .bind(entry.kind)
    .bind(entry.delta)
    .bind(entry.balance_after)
    .bind(entry.account_version)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(inserted.is_some())
}

/// Lock the subscription's watermark row until `tx` ends and return it.
///
/// A missing row is created at the event's own time, which never makes the event stale; a
/// rollback removes it again.
async fn lock_watermark(
    tx: &mut Transaction<'_, Postgres>,
    ordering: &EventOrdering,
) -> Result<Watermark, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO subscription_event_watermarks (stripe_subscription_id, last_event_at, terminal)
        VALUES ($1, $2, FALSE)
        ON CONFLICT (stripe_subscription_id) DO NOTHING
        "#,
    )
    .bind(&ordering.subscription_id)
    .bind(ordering.event_at)
    .execute(&mut **tx)
    .await?;

    let (last_event_at, terminal): (OffsetDateTime, bool) = sqlx::query_as(
        r#"
        SELECT last_event_at, terminal
        FROM subscription_event_watermarks
        WHERE stripe_subscription_id = $1
        FOR UPDATE
        "#,
    )
    .bind(&ordering.subscription_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(Watermark {
        last_event_at,
        terminal,
    })
}

async fn store_watermark(
    tx: &mut Transaction<'_, Postgres>,
    subscription_id: &str,
    mark: Watermark,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE subscription_event_watermarks
        SET last_event_at = $2, terminal = $3, updated_at = NOW()
        WHERE stripe_subscription_id = $1
        "#,
    )
    .bind(subscription_id)
    .bind(mark.last_event_at)
    .bind(mark.terminal)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Account store backed by the `users` and `subscription_event_watermarks` tables.
///
/// Every mutation is a single conditional `UPDATE` that computes the new balance from the
/// stored value. The ledger entry and, for subscription events, the locked watermark are
/// written in the same transaction. Watermark rows are always locked before `users` rows.
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn load(&self, account_id: AccountId) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("SELECT {ACCOUNT_COLUMNS} FROM users WHERE id = $1"))
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Account::try_from).transpose()
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM users WHERE stripe_customer_id = $1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn has_idempotency_key(&self, key: &str) -> BillingResult<bool> {
        let found: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM credit_ledger_entries WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn watermark(&self, subscription_id: &str) -> BillingResult<Option<Watermark>> {
        let row: Option<(OffsetDateTime, bool)> = sqlx::query_as(
            r#"
            SELECT last_event_at, terminal
            FROM subscription_event_watermarks
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last_event_at, terminal)| Watermark {
            last_event_at,
            terminal,
        }))
    }

    async fn commit(
        &self,
        account_id: AccountId,
        expected_version: i64,
        next: &Account,
        entry: &LedgerEntry,
        ordering: Option<&EventOrdering>,
    ) -> BillingResult<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        let mark = match ordering {
            Some(ordering) => {
                let mark = lock_watermark(&mut tx, ordering).await?;
                if ordering.is_stale(Some(&mark)) {
                    tx.rollback().await?;
                    let current = self
                        .load(account_id)
                        .await?
                        .ok_or(BillingError::AccountNotFound(account_id))?;
                    return Ok(CommitOutcome::Stale(current));
                }
                Some((ordering, mark))
            }
            None => None,
        };

        let row: Option<AccountRow> = sqlx::query_as(&format!(
            r#"
            UPDATE users SET
                credits = $3,
                subscription = $4,
                subscription_plan_id = $5,
                status = $6,
                stripe_customer_id = $7,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(expected_version)
        .bind(next.credits)
        .bind(next.subscription.label())
        .bind(next.subscription.plan_id())
        .bind(next.status.as_str())
        .bind(&next.stripe_customer_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return match self.load(account_id).await? {
                Some(_) => Ok(CommitOutcome::VersionMismatch),
                None => Err(BillingError::AccountNotFound(account_id)),
            };
        };

        if !insert_ledger_entry(&mut tx, entry).await? {
            tx.rollback().await?;
            let current = self
                .load(account_id)
                .await?
                .ok_or(BillingError::AccountNotFound(account_id))?;
            return Ok(CommitOutcome::DuplicateKey(current));
        }

        if let Some((ordering, mark)) = mark {
            store_watermark(&mut tx, &ordering.subscription_id, ordering.advance(Some(&mark)))
                .await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed(row.try_into()?))
    }

    async fn apply_atomic(
        &self,
        account_id: AccountId,
        mutation: &EntitlementMutation,
    ) -> BillingResult<Option<AtomicOutcome>> {
        let amount = mutation.credits.amount();
        let subscription = mutation.subscription.as_ref();

        let mut tx = self.pool.begin().await?;

        let mark = match &mutation.ordering {
            Some(ordering) => {
                let mark = lock_watermark(&mut tx, ordering).await?;
                if ordering.is_stale(Some(&mark)) {
                    tx.rollback().await?;
                    return Ok(Some(match self.load(account_id).await? {
                        Some(current) => AtomicOutcome::Stale(current),
                        None => AtomicOutcome::NotFound,
                    }));
                }
                Some((ordering, mark))
            }
            None => None,
        };

        let row: Option<AppliedRow> = sqlx::query_as(&format!(
            r#"
            WITH prev AS (
                SELECT id, credits FROM users WHERE id = $1 FOR UPDATE
            )
            UPDATE users u SET
                credits = CASE $2::TEXT
                    WHEN 'add' THEN u.credits + $3::BIGINT
                    WHEN 'subtract' THEN u.credits - $3::BIGINT
                    WHEN 'set' THEN $3::BIGINT
                    ELSE u.credits
                END,
                subscription = CASE WHEN $4::BOOLEAN THEN $5::TEXT ELSE u.subscription END,
                subscription_plan_id = CASE WHEN $4::BOOLEAN THEN $6::UUID
                    ELSE u.subscription_plan_id END,
                status = CASE WHEN $4::BOOLEAN
                        AND (u.status <> 'banned' OR $7::TEXT <> 'active') THEN $7::TEXT
                    ELSE u.status END,
                stripe_customer_id = COALESCE($8::TEXT, u.stripe_customer_id),
                version = u.version + 1,
                updated_at = NOW()
            FROM prev
            WHERE u.id = prev.id
              AND ($2::TEXT <> 'subtract' OR u.credits >= $3::BIGINT)
              AND ($2::TEXT <> 'add' OR u.credits <= 9223372036854775807 - $3::BIGINT)
            RETURNING {columns}, prev.credits AS previous_credits
            "#,
            columns = ACCOUNT_COLUMNS
                .split(", ")
                .map(|c| format!("u.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(account_id)
        .bind(credit_op(mutation.credits))
        .bind(amount)
        .bind(subscription.is_some())
        .bind(subscription.and_then(|s| s.subscription.label().map(str::to_string)))
        .bind(subscription.and_then(|s| s.subscription.plan_id()))
        .bind(subscription.map(|s| s.status.as_str()))
        .bind(&mutation.customer_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            let Some(current) = self.load(account_id).await? else {
                return Ok(Some(AtomicOutcome::NotFound));
            };
            if let Some(key) = &mutation.idempotency_key {
                if self.has_idempotency_key(key).await? {
                    return Ok(Some(AtomicOutcome::Duplicate(current)));
                }
            }
            if let CreditChange::Add(amount) = mutation.credits {
                if current.credits.checked_add(amount).is_none() {
                    return Ok(Some(AtomicOutcome::Overflow));
                }
            }
            return Ok(Some(AtomicOutcome::Insufficient {
                available: current.credits,
            }));
        };

        let previous_credits = row.previous_credits;
        let account: Account = row.account.try_into()?;
        let entry = LedgerEntry {
            account_id,
            idempotency_key: mutation.idempotency_key.clone(),
            kind: mutation.kind(),
            delta: account.credits - previous_credits,
            balance_after: account.credits,
            account_version: account.version,
        };

        if !insert_ledger_entry(&mut tx, &entry).await? {
            tx.rollback().await?;
            let current = self
                .load(account_id)
                .await?
                .ok_or(BillingError::AccountNotFound(account_id))?;
            return Ok(Some(AtomicOutcome::Duplicate(current)));
        }

        if let Some((ordering, mark)) = mark {
            store_watermark(&mut tx, &ordering.subscription_id, ordering.advance(Some(&mark)))
                .await?;
        }

        tx.commit().await?;
        Ok(Some(AtomicOutcome::Applied(account)))
    }
}

/// Webhook event log backed by `stripe_webhook_events`.
#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome> {
        // INSERT...ON CONFLICT...RETURNING lets exactly one concurrent delivery claim the
        // event. Previous attempts that errored, or that have been stuck in `processing`
        // past the timeout, can be claimed again.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CASE
                    WHEN stripe_webhook_events.processing_result = 'processing'
                        THEN CONCAT('Recovered from stuck state at ', NOW()::TEXT)
                    ELSE stripe_webhook_events.error_message
                END
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_at)
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::from(e)
        })?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((status,)) if status == "processing" => ClaimOutcome::InFlight,
            Some(_) => ClaimOutcome::AlreadyProcessed,
            // Pruned between the two statements; the claim can be retried by the sender.
            None => ClaimOutcome::InFlight,
        })
    }

    async fn finish(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, event_timestamp,
                   processing_result, processing_started_at, error_message,
                   created_at
            FROM stripe_webhook_events
            WHERE processing_result = 'error'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn prune(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM stripe_webhook_events
            WHERE created_at < $1 AND processing_result <> 'processing'
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Row type for `subscription_plans`
#[derive(Debug, FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    credits: i64,
    price_cents: i64,
    stripe_price_id: String,
    billing_cycle: String,
}

impl TryFrom<PlanRow> for SubscriptionPlan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        let billing_cycle: BillingCycle = row.billing_cycle.parse().map_err(|e| {
            BillingError::TransientStoreFailure(format!("subscription_plans.billing_cycle: {}", e))
        })?;
        Ok(SubscriptionPlan {
            id: row.id,
            name: row.name,
            credits: row.credits,
            price_cents: row.price_cents,
            stripe_price_id: row.stripe_price_id,
            billing_cycle,
        })
    }
}

const PLAN_COLUMNS: &str = "id, name, credits, price_cents, stripe_price_id, billing_cycle";

#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn plan_where_text(
        &self,
        column: &str,
        value: &str,
    ) -> BillingResult<Option<SubscriptionPlan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE {column} = $1"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionPlan::try_from).transpose()
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn plan_by_id(&self, plan_id: Uuid) -> BillingResult<Option<SubscriptionPlan>> {
        let row: Option<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE id = $1"
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionPlan::try_from).transpose()
    }

    async fn plan_by_price_id(&self, price_id: &str) -> BillingResult<Option<SubscriptionPlan>> {
        self.plan_where_text("stripe_price_id", price_id).await
    }

    async fn plan_by_name(&self, name: &str) -> BillingResult<Option<SubscriptionPlan>> {
        self.plan_where_text("name", name).await
    }

    async fn credit_pricing(&self) -> BillingResult<Option<CreditPricing>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT price_per_credit_cents, currency FROM credit_pricing WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(price_per_credit_cents, currency)| CreditPricing {
            price_per_credit_cents,
            currency,
        }))
    }

    async fn tool_config(&self, tool_name: &str) -> BillingResult<Option<ToolConfig>> {
        let row: Option<(String, i64, String)> = sqlx::query_as(
            "SELECT tool_name, credit_cost, ai_model FROM tool_configs WHERE tool_name = $1",
        )
        .bind(tool_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(tool_name, credit_cost, ai_model)| ToolConfig {
            tool_name,
            credit_cost,
            ai_model,
        }))
    }
}

#[derive(Clone)]
pub struct PgBacklog {
    pool: PgPool,
}

impl PgBacklog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeductionBacklog for PgBacklog {
    async fn enqueue(
        &self,
        account_id: AccountId,
        tool_name: &str,
        amount: i64,
        idempotency_key: &str,
        error: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deduction_backlog (account_id, tool_name, amount, idempotency_key, last_error)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(tool_name)
        .bind(amount)
        .bind(idempotency_key)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due(&self, limit: i64) -> BillingResult<Vec<PendingDeduction>> {
        let rows: Vec<PendingDeduction> = sqlx::query_as(
            r#"
            SELECT id, account_id, tool_name, amount, idempotency_key, attempts, last_error
            FROM deduction_backlog
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_done(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE deduction_backlog SET status = 'done', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str, abandon: bool) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE deduction_backlog
            SET attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN $3 THEN 'abandoned' ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(abandon)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
