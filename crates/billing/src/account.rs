//! Account entitlement model
//!
//! An account's monetizable state is its credit balance, its subscription and its status.
//! Every change to that state is described as one [`EntitlementMutation`] so that a credit
//! change and a subscription change triggered by the same event land in a single write.

use creditledger_shared::{AccountLevel, AccountStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::Watermark;

pub type AccountId = Uuid;

/// Label persisted in `users.subscription` once a subscription ends.
pub const CANCELLED_LABEL: &str = "Cancelled";

/// Subscription an account is on.
///
/// Plans are referenced by id; the name is carried alongside for display and for the
/// `users.subscription` text column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriptionState {
    None,
    Plan { plan_id: Uuid, name: String },
    /// A plan name with no plan reference, left over from rows written before plans had ids.
    Unlinked { name: String },
    Cancelled,
}

impl SubscriptionState {
    pub fn from_columns(subscription: Option<String>, plan_id: Option<Uuid>) -> Self {
        match (subscription, plan_id) {
            (Some(name), Some(plan_id)) => SubscriptionState::Plan { plan_id, name },
            (None, Some(plan_id)) => SubscriptionState::Plan {
                plan_id,
                name: String::new(),
            },
            (Some(name), None) if name == CANCELLED_LABEL => SubscriptionState::Cancelled,
            (Some(name), None) => SubscriptionState::Unlinked { name },
            (None, None) => SubscriptionState::None,
        }
    }

    /// Value for the `users.subscription` column.
    pub fn label(&self) -> Option<&str> {
        match self {
            SubscriptionState::None => None,
            SubscriptionState::Plan { name, .. } | SubscriptionState::Unlinked { name } => {
                Some(name.as_str())
            }
            SubscriptionState::Cancelled => Some(CANCELLED_LABEL),
        }
    }

    /// Value for the `users.subscription_plan_id` column.
    pub fn plan_id(&self) -> Option<Uuid> {
        match self {
            SubscriptionState::Plan { plan_id, .. } => Some(*plan_id),
            _ => None,
        }
    }
}

/// One row of the `users` table, as far as billing is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub display_name: Option<String>,
    pub credits: i64,
    pub subscription: SubscriptionState,
    pub status: AccountStatus,
    pub stripe_customer_id: Option<String>,
    pub account_level: AccountLevel,
    pub last_login: Option<OffsetDateTime>,
    /// Bumped on every write; used for optimistic concurrency.
    #[serde(skip)]
    pub version: i64,
}

impl Account {
    pub fn new(id: AccountId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            display_name: None,
            credits: 0,
            subscription: SubscriptionState::None,
            status: AccountStatus::Active,
            stripe_customer_id: None,
            account_level: AccountLevel::Customer,
            last_login: None,
            version: 0,
        }
    }

    pub fn entitlement(&self) -> Entitlement {
        Entitlement {
            account_id: self.id,
            credits: self.credits,
            subscription: self.subscription.clone(),
            status: self.status,
        }
    }

    /// Compute the state after `mutation`, without persisting anything.
    ///
    /// Fails with `InsufficientCredits` when a deduction would take the balance below zero.
    pub fn apply(&self, mutation: &EntitlementMutation) -> BillingResult<Account> {
        mutation.validate()?;

        let credits = match mutation.credits {
            CreditChange::Unchanged => self.credits,
            CreditChange::Add(amount) => self
                .credits
                .checked_add(amount)
                .ok_or_else(|| credit_overflow(amount))?,
            CreditChange::Subtract(amount) => {
                if self.credits < amount {
                    return Err(BillingError::InsufficientCredits {
                        required: amount,
                        available: self.credits,
                    });
                }
                self.credits - amount
            }
            CreditChange::Set(amount) => amount,
        };

        let mut next = self.clone();
        next.credits = credits;
        if let Some(change) = &mutation.subscription {
            next.subscription = change.subscription.clone();
            next.status = resolve_status(self.status, change.status);
        }
        if let Some(customer_id) = &mutation.customer_id {
            next.stripe_customer_id = Some(customer_id.clone());
        }
        next.version = self.version + 1;
        Ok(next)
    }
}

/// Billing events never reactivate a `Banned` account; revocations still land as `Inactive`.
pub fn resolve_status(current: AccountStatus, requested: AccountStatus) -> AccountStatus {
    if current == AccountStatus::Banned && requested == AccountStatus::Active {
        AccountStatus::Banned
    } else {
        requested
    }
}

/// Error for a credit that would push the balance past `i64::MAX`.
pub fn credit_overflow(amount: i64) -> BillingError {
    BillingError::InvalidInput(format!("credit of {} overflows balance", amount))
}

/// Read-only view of an account's entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub account_id: AccountId,
    pub credits: i64,
    pub subscription: SubscriptionState,
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditChange {
    Unchanged,
    Add(i64),
    Subtract(i64),
    Set(i64),
}

impl CreditChange {
    pub fn amount(&self) -> i64 {
        match self {
            CreditChange::Unchanged => 0,
            CreditChange::Add(n) | CreditChange::Subtract(n) | CreditChange::Set(n) => *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub subscription: SubscriptionState,
    pub status: AccountStatus,
}

impl SubscriptionChange {
    pub fn active(plan_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            subscription: SubscriptionState::Plan {
                plan_id,
                name: name.into(),
            },
            status: AccountStatus::Active,
        }
    }

    /// Plan known only by name, granting the credits named in the event.
    pub fn unlinked(name: impl Into<String>) -> Self {
        Self {
            subscription: SubscriptionState::Unlinked { name: name.into() },
            status: AccountStatus::Active,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            subscription: SubscriptionState::Cancelled,
            status: AccountStatus::Inactive,
        }
    }
}

/// How a subscription event orders against earlier events for the same subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingRule {
    /// Skipped when a newer event, or the deletion, was already applied.
    Latest,
    /// Skipped only once the subscription has been deleted.
    UntilDeleted,
    /// Always applied; marks the subscription deleted.
    Deletion,
}

/// Watermark guard written in the same store operation as the mutation it rides on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOrdering {
    pub subscription_id: String,
    pub event_at: OffsetDateTime,
    pub rule: OrderingRule,
}

impl EventOrdering {
    pub fn latest(subscription_id: impl Into<String>, event_at: OffsetDateTime) -> Self {
        Self::new(subscription_id, event_at, OrderingRule::Latest)
    }

    pub fn until_deleted(subscription_id: impl Into<String>, event_at: OffsetDateTime) -> Self {
        Self::new(subscription_id, event_at, OrderingRule::UntilDeleted)
    }

    pub fn deletion(subscription_id: impl Into<String>, event_at: OffsetDateTime) -> Self {
        Self::new(subscription_id, event_at, OrderingRule::Deletion)
    }

    fn new(subscription_id: impl Into<String>, event_at: OffsetDateTime, rule: OrderingRule) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            event_at,
            rule,
        }
    }

    pub fn is_stale(&self, mark: Option<&Watermark>) -> bool {
        match (self.rule, mark) {
            (OrderingRule::Deletion, _) | (_, None) => false,
            (_, Some(mark)) if mark.terminal => true,
            (OrderingRule::Latest, Some(mark)) => mark.last_event_at > self.event_at,
            (OrderingRule::UntilDeleted, Some(_)) => false,
        }
    }

    pub fn terminal(&self) -> bool {
        self.rule == OrderingRule::Deletion
    }

    /// Watermark after this event is applied; never moves backwards.
    pub fn advance(&self, mark: Option<&Watermark>) -> Watermark {
        match mark {
            Some(mark) => Watermark {
                last_event_at: mark.last_event_at.max(self.event_at),
                terminal: mark.terminal || self.terminal(),
            },
            None => Watermark {
                last_event_at: self.event_at,
                terminal: self.terminal(),
            },
        }
    }
}

/// A single atomic change to an account's entitlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementMutation {
    pub credits: CreditChange,
    pub subscription: Option<SubscriptionChange>,
    pub customer_id: Option<String>,
    /// When set, the mutation is applied at most once per key.
    pub idempotency_key: Option<String>,
    /// When set, the mutation is skipped if the subscription has moved past this event.
    pub ordering: Option<EventOrdering>,
}

impl EntitlementMutation {
    fn with_credits(credits: CreditChange) -> Self {
        Self {
            credits,
            subscription: None,
            customer_id: None,
            idempotency_key: None,
            ordering: None,
        }
    }

    pub fn credit(amount: i64) -> Self {
        Self::with_credits(CreditChange::Add(amount))
    }

    pub fn deduct(amount: i64) -> Self {
        Self::with_credits(CreditChange::Subtract(amount))
    }

    pub fn set_balance(amount: i64) -> Self {
        Self::with_credits(CreditChange::Set(amount))
    }

    pub fn subscription_only(change: SubscriptionChange) -> Self {
        Self::with_credits(CreditChange::Unchanged).subscription(change)
    }

    pub fn subscription(mut self, change: SubscriptionChange) -> Self {
        self.subscription = Some(change);
        self
    }

    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn ordered(mut self, ordering: EventOrdering) -> Self {
        self.ordering = Some(ordering);
        self
    }

    pub fn validate(&self) -> BillingResult<()> {
        let amount = self.credits.amount();
        if amount < 0 {
            return Err(BillingError::InvalidInput(format!(
                "credit amounts must be non-negative, got {}",
                amount
            )));
        }
        Ok(())
    }

    /// Kind recorded in the ledger entry for this mutation.
    pub fn kind(&self) -> &'static str {
        match (self.credits, self.subscription.is_some()) {
            (CreditChange::Add(_), _) => "credit",
            (CreditChange::Subtract(_), _) => "deduct",
            (CreditChange::Set(_), true) => "subscription_reset",
            (CreditChange::Set(_), false) => "set_balance",
            (CreditChange::Unchanged, _) => "subscription",
        }
    }
}

/// Row appended to `credit_ledger_entries` alongside every applied mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub account_id: AccountId,
    pub idempotency_key: Option<String>,
    pub kind: &'static str,
    pub delta: i64,
    pub balance_after: i64,
    /// Account version written together with this entry.
    pub account_version: i64,
}

impl LedgerEntry {
    pub fn between(before: &Account, after: &Account, mutation: &EntitlementMutation) -> Self {
        Self {
            account_id: after.id,
            idempotency_key: mutation.idempotency_key.clone(),
            kind: mutation.kind(),
            delta: after.credits - before.credits,
            balance_after: after.credits,
            account_version: after.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_with(credits: i64) -> Account {
        let mut account = Account::new(Uuid::new_v4(), "user@example.com");
        account.credits = credits;
        account
    }

    #[test]
    fn deduct_below_zero_is_rejected() {
        let account = account_with(5);
        let err = account.apply(&EntitlementMutation::deduct(10)).unwrap_err();
        match err {
            BillingError::InsufficientCredits {
                required,
                available,
            } => {
                assert_eq!(required, 10);
                assert_eq!(available, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deduct_exact_balance_reaches_zero() {
        let account = account_with(20);
        let next = account.apply(&EntitlementMutation::deduct(20)).unwrap();
        assert_eq!(next.credits, 0);
        assert_eq!(next.version, account.version + 1);
    }

    #[test]
    fn negative_amounts_are_invalid() {
        let account = account_with(20);
        assert!(matches!(
            account.apply(&EntitlementMutation::credit(-1)),
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[test]
    fn renewal_sets_credits_and_subscription_together() {
        let account = account_with(3);
        let plan_id = Uuid::new_v4();
        let mutation = EntitlementMutation::set_balance(500)
            .subscription(SubscriptionChange::active(plan_id, "Pro"));
        let next = account.apply(&mutation).unwrap();

        assert_eq!(next.credits, 500);
        assert_eq!(next.status, AccountStatus::Active);
        assert_eq!(next.subscription.plan_id(), Some(plan_id));
        assert_eq!(next.subscription.label(), Some("Pro"));
        assert_eq!(mutation.kind(), "subscription_reset");
    }

    #[test]
    fn banned_accounts_are_not_reactivated() {
        let mut account = account_with(0);
        account.status = AccountStatus::Banned;
        let next = account
            .apply(&EntitlementMutation::subscription_only(
                SubscriptionChange::active(Uuid::new_v4(), "Pro"),
            ))
            .unwrap();
        assert_eq!(next.status, AccountStatus::Banned);
    }

    #[test]
    fn cancellation_leaves_banned_accounts_inactive() {
        let mut account = account_with(40);
        account.status = AccountStatus::Banned;
        let next = account
            .apply(
                &EntitlementMutation::set_balance(0).subscription(SubscriptionChange::cancelled()),
            )
            .unwrap();
        assert_eq!(next.status, AccountStatus::Inactive);
        assert_eq!(next.subscription, SubscriptionState::Cancelled);
        assert_eq!(next.credits, 0);
    }

    #[test]
    fn overflowing_credit_is_invalid_input() {
        let account = account_with(i64::MAX - 1);
        let err = account.apply(&EntitlementMutation::credit(2)).unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(!err.is_retryable());
    }

    fn at(offset: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + offset).unwrap()
    }

    #[test]
    fn ordering_rules_against_watermarks() {
        let open = Watermark {
            last_event_at: at(10),
            terminal: false,
        };
        let deleted = Watermark {
            last_event_at: at(0),
            terminal: true,
        };

        assert!(!EventOrdering::latest("sub_1", at(0)).is_stale(None));
        assert!(EventOrdering::latest("sub_1", at(5)).is_stale(Some(&open)));
        assert!(!EventOrdering::latest("sub_1", at(10)).is_stale(Some(&open)));
        assert!(EventOrdering::latest("sub_1", at(20)).is_stale(Some(&deleted)));

        assert!(!EventOrdering::until_deleted("sub_1", at(5)).is_stale(Some(&open)));
        assert!(EventOrdering::until_deleted("sub_1", at(5)).is_stale(Some(&deleted)));

        assert!(!EventOrdering::deletion("sub_1", at(-5)).is_stale(Some(&deleted)));
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mark = Watermark {
            last_event_at: at(10),
            terminal: false,
        };
        let advanced = EventOrdering::deletion("sub_1", at(0)).advance(Some(&mark));
        assert_eq!(advanced.last_event_at, at(10));
        assert!(advanced.terminal);

        let fresh = EventOrdering::latest("sub_1", at(3)).advance(None);
        assert_eq!(fresh.last_event_at, at(3));
        assert!(!fresh.terminal);
    }

    #[test]
    fn subscription_columns_round_trip() {
        let plan_id = Uuid::new_v4();
        let state = SubscriptionState::from_columns(Some("Pro".into()), Some(plan_id));
        assert_eq!(state.label(), Some("Pro"));
        assert_eq!(state.plan_id(), Some(plan_id));

        let cancelled = SubscriptionState::from_columns(Some(CANCELLED_LABEL.into()), None);
        assert_eq!(cancelled, SubscriptionState::Cancelled);

        let legacy = SubscriptionState::from_columns(Some("Starter".into()), None);
        assert_eq!(
            legacy,
            SubscriptionState::Unlinked {
                name: "Starter".into()
            }
        );
    }

    #[test]
    fn ledger_entry_records_delta() {
        let before = account_with(50);
        let mutation = EntitlementMutation::deduct(20).idempotency_key("usage:1");
        let after = before.apply(&mutation).unwrap();
        let entry = LedgerEntry::between(&before, &after, &mutation);
        assert_eq!(entry.delta, -20);
        assert_eq!(entry.balance_after, 30);
        assert_eq!(entry.kind, "deduct");
        assert_eq!(entry.idempotency_key.as_deref(), Some("usage:1"));
        assert_eq!(entry.account_version, before.version + 1);
    }
}
