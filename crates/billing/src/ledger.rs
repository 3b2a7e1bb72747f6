//! Entitlement ledger
//!
//! The only writer of an account's credits, subscription and status. Each operation reads the
//! stored row and writes the result in one store operation: stores that can express the update
//! as a single conditional statement do so, otherwise the ledger runs a bounded
//! compare-and-swap loop against the row version.

use std::sync::Arc;

use creditledger_shared::AccountStatus;
use serde::Serialize;

use crate::account::{
    credit_overflow, Account, AccountId, CreditChange, Entitlement, EntitlementMutation,
    LedgerEntry, SubscriptionChange, SubscriptionState,
};
use crate::error::{BillingError, BillingResult};
use crate::store::{AccountStore, AtomicOutcome, CommitOutcome, Watermark};

/// Compare-and-swap attempts before giving up with `ConcurrentUpdateConflict`.
pub const MAX_COMMIT_ATTEMPTS: usize = 5;

/// State of an account after a ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReceipt {
    pub account_id: AccountId,
    pub credits: i64,
    pub subscription: SubscriptionState,
    pub status: AccountStatus,
    /// False when the mutation's idempotency key had already been applied, or the
    /// mutation was stale.
    pub applied: bool,
    /// True when the subscription had already moved past the mutation's event.
    pub stale: bool,
}

impl LedgerReceipt {
    fn from_account(account: &Account, applied: bool) -> Self {
        Self {
            account_id: account.id,
            credits: account.credits,
            subscription: account.subscription.clone(),
            status: account.status,
            applied,
            stale: false,
        }
    }

    fn stale(account: &Account, mutation: &EntitlementMutation) -> Self {
        if let Some(ordering) = &mutation.ordering {
            tracing::info!(
                account_id = %account.id,
                subscription_id = %ordering.subscription_id,
                idempotency_key = ?mutation.idempotency_key,
                "Subscription already moved past this event, skipping"
            );
        }
        Self {
            stale: true,
            ..Self::from_account(account, false)
        }
    }
}

#[derive(Clone)]
pub struct EntitlementLedger {
    store: Arc<dyn AccountStore>,
}

impl EntitlementLedger {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self { store }
    }

    /// Authoritative read of the account's entitlement.
    pub async fn balance(&self, account_id: AccountId) -> BillingResult<Entitlement> {
        Ok(self.load_required(account_id).await?.entitlement())
    }

    pub async fn account(&self, account_id: AccountId) -> BillingResult<Account> {
        self.load_required(account_id).await
    }

    /// Account linked to a payment-processor customer, if any.
    pub async fn account_for_customer(&self, customer_id: &str) -> BillingResult<Option<AccountId>> {
        Ok(self
            .store
            .find_by_customer_id(customer_id)
            .await?
            .map(|account| account.id))
    }

    /// Latest event applied for a billing subscription.
    pub async fn watermark(&self, subscription_id: &str) -> BillingResult<Option<Watermark>> {
        self.store.watermark(subscription_id).await
    }

    pub async fn credit(&self, account_id: AccountId, amount: i64) -> BillingResult<LedgerReceipt> {
        self.apply(account_id, EntitlementMutation::credit(amount))
            .await
    }

    pub async fn set_balance(
        &self,
        account_id: AccountId,
        amount: i64,
    ) -> BillingResult<LedgerReceipt> {
        self.apply(account_id, EntitlementMutation::set_balance(amount))
            .await
    }

    /// Fails with `InsufficientCredits` and leaves the balance untouched when the account
    /// holds fewer than `amount` credits.
    pub async fn deduct(&self, account_id: AccountId, amount: i64) -> BillingResult<LedgerReceipt> {
        self.apply(account_id, EntitlementMutation::deduct(amount))
            .await
    }

    /// Update subscription and status together with the credit change from the same event.
    pub async fn set_subscription_state(
        &self,
        account_id: AccountId,
        change: SubscriptionChange,
        credits: CreditChange,
    ) -> BillingResult<LedgerReceipt> {
        let mutation = EntitlementMutation {
            credits,
            subscription: Some(change),
            customer_id: None,
            idempotency_key: None,
            ordering: None,
        };
        self.apply(account_id, mutation).await
    }

    /// Apply one mutation as a single write.
    ///
    /// A mutation whose idempotency key was already recorded returns the current state with
    /// `applied == false`. An ordered mutation whose subscription already moved past its event
    /// does the same with `stale == true`; the check and the write happen in one store
    /// operation.
    pub async fn apply(
        &self,
        account_id: AccountId,
        mutation: EntitlementMutation,
    ) -> BillingResult<LedgerReceipt> {
        mutation.validate()?;

        if let Some(key) = &mutation.idempotency_key {
            if self.store.has_idempotency_key(key).await? {
                return self.already_applied(account_id, key).await;
            }
        }

        if let Some(outcome) = self.store.apply_atomic(account_id, &mutation).await? {
            return match outcome {
                AtomicOutcome::Applied(account) => {
                    log_applied(&account, &mutation);
                    Ok(LedgerReceipt::from_account(&account, true))
                }
                AtomicOutcome::Duplicate(account) => {
                    tracing::info!(
                        account_id = %account_id,
                        idempotency_key = ?mutation.idempotency_key,
                        "Ledger mutation already applied"
                    );
                    Ok(LedgerReceipt::from_account(&account, false))
                }
                AtomicOutcome::Stale(account) => Ok(LedgerReceipt::stale(&account, &mutation)),
                AtomicOutcome::NotFound => Err(BillingError::AccountNotFound(account_id)),
                AtomicOutcome::Insufficient { available } => {
                    Err(insufficient(account_id, mutation.credits.amount(), available))
                }
                AtomicOutcome::Overflow => Err(credit_overflow(mutation.credits.amount())),
            };
        }

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self.load_required(account_id).await?;
            let next = match current.apply(&mutation) {
                Ok(next) => next,
                Err(BillingError::InsufficientCredits {
                    required,
                    available,
                }) => return Err(insufficient(account_id, required, available)),
                Err(e) => return Err(e),
            };
            let entry = LedgerEntry::between(&current, &next, &mutation);

            match self
                .store
                .commit(
                    account_id,
                    current.version,
                    &next,
                    &entry,
                    mutation.ordering.as_ref(),
                )
                .await?
            {
                CommitOutcome::Committed(account) => {
                    log_applied(&account, &mutation);
                    return Ok(LedgerReceipt::from_account(&account, true));
                }
                CommitOutcome::DuplicateKey(account) => {
                    return Ok(LedgerReceipt::from_account(&account, false));
                }
                CommitOutcome::Stale(account) => {
                    return Ok(LedgerReceipt::stale(&account, &mutation));
                }
                CommitOutcome::VersionMismatch => {
                    tracing::debug!(
                        account_id = %account_id,
                        attempt = attempt,
                        "Account changed during ledger write, retrying"
                    );
                }
            }
        }

        tracing::warn!(
            account_id = %account_id,
            attempts = MAX_COMMIT_ATTEMPTS,
            kind = mutation.kind(),
            "Ledger write lost every compare-and-swap attempt"
        );
        Err(BillingError::ConcurrentUpdateConflict(account_id))
    }

    async fn already_applied(
        &self,
        account_id: AccountId,
        key: &str,
    ) -> BillingResult<LedgerReceipt> {
        let current = self.load_required(account_id).await?;
        tracing::info!(
            account_id = %account_id,
            idempotency_key = %key,
            "Ledger mutation already applied"
        );
        Ok(LedgerReceipt::from_account(&current, false))
    }

    async fn load_required(&self, account_id: AccountId) -> BillingResult<Account> {
        self.store
            .load(account_id)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))
    }
}

fn insufficient(account_id: AccountId, required: i64, available: i64) -> BillingError {
    // Expected on the usage path; not an error condition.
    tracing::debug!(
        account_id = %account_id,
        required = required,
        available = available,
        "Insufficient credits"
    );
    BillingError::InsufficientCredits {
        required,
        available,
    }
}

fn log_applied(account: &Account, mutation: &EntitlementMutation) {
    tracing::info!(
        account_id = %account.id,
        kind = mutation.kind(),
        amount = mutation.credits.amount(),
        credits = account.credits,
        subscription = ?account.subscription.label(),
        status = %account.status.as_str(),
        idempotency_key = ?mutation.idempotency_key,
        "Ledger mutation applied"
    );
}
