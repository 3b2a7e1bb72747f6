// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Creditledger Billing Module
//!
//! Owns every change to an account's credits, subscription and status.
//!
//! ## Features
//!
//! - **Entitlement ledger**: atomic credit, deduction and subscription updates with
//!   idempotency keys and bounded optimistic retries
//! - **Webhooks**: verified, idempotent, order-tolerant handling of Stripe events
//! - **Checkout**: hosted checkout sessions for subscriptions and credit purchases
//! - **Tool usage**: gate paid tool runs on the balance and settle them afterwards, with a
//!   remediation backlog for deductions that could not be applied
//! - **Invariants**: scheduled consistency checks over the ledger tables

pub mod account;
pub mod checkout;
pub mod client;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod store;
pub mod tools;
pub mod webhooks;


// Account
pub use account::{
    Account, AccountId, CreditChange, Entitlement, EntitlementMutation, LedgerEntry,
    SubscriptionChange, SubscriptionState,
};

// Checkout
pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService};

// Client
pub use client::{
    CheckoutMode, MockPaymentGateway, PaymentGateway, StripeClient, StripeConfig,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{EventMetadata, PaymentEvent};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{EntitlementLedger, LedgerReceipt, MAX_COMMIT_ATTEMPTS};

// Tools
pub use tools::{BacklogRunSummary, Settlement, ToolQuote, ToolUsageService};

// Webhooks
pub use webhooks::{sign_payload, verify_signature, WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;
use store::{
    AccountStore, Catalog, DeductionBacklog, EventLog, InMemoryAccountStore, InMemoryBacklog,
    InMemoryCatalog, InMemoryEventLog, PgAccountStore, PgBacklog, PgCatalog, PgEventLog,
};

/// Storage behind the billing services.
#[derive(Clone)]
pub struct BillingStores {
    pub accounts: Arc<dyn AccountStore>,
    pub events: Arc<dyn EventLog>,
    pub catalog: Arc<dyn Catalog>,
    pub backlog: Arc<dyn DeductionBacklog>,
}

impl BillingStores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            accounts: Arc::new(PgAccountStore::new(pool.clone())),
            events: Arc::new(PgEventLog::new(pool.clone())),
            catalog: Arc::new(PgCatalog::new(pool.clone())),
            backlog: Arc::new(PgBacklog::new(pool)),
        }
    }

    pub fn in_memory(accounts: Arc<InMemoryAccountStore>, catalog: InMemoryCatalog) -> Self {
        Self {
            accounts,
            events: Arc::new(InMemoryEventLog::new()),
            catalog: Arc::new(catalog),
            backlog: Arc::new(InMemoryBacklog::new()),
        }
    }
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub ledger: EntitlementLedger,
    pub webhooks: WebhookHandler,
    pub checkout: CheckoutService,
    pub tools: ToolUsageService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let gateway = Arc::new(StripeClient::new(&config));
        Self::with_parts(
            BillingStores::postgres(pool),
            gateway,
            &config.webhook_secret,
            config.webhook_tolerance_secs,
        )
    }

    pub fn with_parts(
        stores: BillingStores,
        gateway: Arc<dyn PaymentGateway>,
        webhook_secret: &str,
        webhook_tolerance_secs: i64,
    ) -> Self {
        let ledger = EntitlementLedger::new(stores.accounts.clone());

        Self {
            webhooks: WebhookHandler::new(
                ledger.clone(),
                stores.events.clone(),
                stores.catalog.clone(),
                gateway.clone(),
                webhook_secret,
                webhook_tolerance_secs,
            ),
            checkout: CheckoutService::new(ledger.clone(), stores.catalog.clone(), gateway),
            tools: ToolUsageService::new(ledger.clone(), stores.catalog, stores.backlog),
            ledger,
        }
    }
}
