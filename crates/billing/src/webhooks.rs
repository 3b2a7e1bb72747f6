//! Stripe webhook handling
//!
//! Verifies signed webhook deliveries and turns each handled event into at most one ledger
//! mutation. Deliveries are claimed in the event log before processing, mutations carry the
//! event id as their idempotency key, and subscription events older than the latest one
//! applied for the same subscription are skipped. The ordering check is re-run inside the
//! ledger write that applies the event.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

use crate::account::{EntitlementMutation, EventOrdering, SubscriptionChange};
use crate::client::PaymentGateway;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutSessionObject, EventKind, EventMetadata, InvoiceObject, PaymentEvent,
    SubscriptionObject,
};
use crate::ledger::{EntitlementLedger, LedgerReceipt};
use crate::store::{Catalog, ClaimOutcome, EventLog, ProcessingResult, WebhookEventRecord};

type HmacSha256 = Hmac<Sha256>;

/// Compute the `v1` signature Stripe sends for `payload` signed at `timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>...]`) against `payload`.
///
/// The whole `whsec_...` string is the HMAC key. Any one matching `v1` entry is accepted.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => signatures.push(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::InvalidSignature
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::InvalidSignature);
    }

    let within_tolerance = now
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .is_some_and(|diff| diff <= tolerance_secs.unsigned_abs());
    if !within_tolerance {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::InvalidSignature);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::InvalidSignature
    })?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let expected = mac.finalize().into_bytes();

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|decoded| bool::from(expected.as_slice().ct_eq(decoded.as_slice())))
            .unwrap_or(false)
    });

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::InvalidSignature);
    }

    Ok(())
}

/// What happened to one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event changed the account.
    Applied(LedgerReceipt),
    /// The event, or its ledger mutation, was already processed.
    Duplicate,
    /// A newer event for the same subscription was already applied.
    Stale,
    /// Event type or state the ledger does not act on.
    Ignored,
    /// The event cannot be applied; redelivery would not help.
    Dropped(String),
    /// Another delivery of the same event is still being processed.
    InFlight,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied(_) => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Stale => "stale",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Dropped(_) => "dropped",
            WebhookOutcome::InFlight => "in_flight",
        }
    }

    fn from_receipt(receipt: LedgerReceipt) -> Self {
        if receipt.stale {
            WebhookOutcome::Stale
        } else if receipt.applied {
            WebhookOutcome::Applied(receipt)
        } else {
            WebhookOutcome::Duplicate
        }
    }
}

/// Credits and subscription granted by a resolved plan.
struct GrantedPlan {
    change: SubscriptionChange,
    credits: i64,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    ledger: EntitlementLedger,
    events: Arc<dyn EventLog>,
    catalog: Arc<dyn Catalog>,
    gateway: Arc<dyn PaymentGateway>,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl WebhookHandler {
    pub fn new(
        ledger: EntitlementLedger,
        events: Arc<dyn EventLog>,
        catalog: Arc<dyn Catalog>,
        gateway: Arc<dyn PaymentGateway>,
        webhook_secret: impl Into<String>,
        tolerance_secs: i64,
    ) -> Self {
        Self {
            ledger,
            events,
            catalog,
            gateway,
            webhook_secret: webhook_secret.into(),
            tolerance_secs,
        }
    }

    /// Verify and parse a Stripe webhook delivery
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<PaymentEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<PaymentEvent> {
        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            self.tolerance_secs,
            now,
        )?;

        let event = PaymentEvent::parse(payload).map_err(|e| {
            tracing::error!(error = %e, "Failed to parse webhook event JSON");
            e
        })?;

        tracing::debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            "Webhook signature verified"
        );

        Ok(event)
    }

    /// Handle a verified event.
    ///
    /// Returns `Err` only for failures the sender should retry; every other outcome is an
    /// acknowledgement.
    pub async fn handle_event(&self, event: PaymentEvent) -> BillingResult<WebhookOutcome> {
        if !event.is_handled() {
            tracing::debug!(
                event_type = %event.event_type,
                event_id = %event.id,
                "Unhandled webhook event type"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let event_at = event.created_at();

        match self
            .events
            .claim(&event.id, &event.event_type, event_at)
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event - already processed"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            ClaimOutcome::InFlight => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event is being processed by another worker"
                );
                return Ok(WebhookOutcome::InFlight);
            }
        }

        tracing::info!(
            event_type = %event.event_type,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let (result, error_message, outcome) = match self.process(&event, event_at).await {
            Ok(outcome) => (ProcessingResult::Success, None, Ok(outcome)),
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed, sender will retry"
                );
                (ProcessingResult::Error, Some(e.to_string()), Err(e))
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Dropping webhook event"
                );
                let reason = e.to_string();
                (
                    ProcessingResult::Dropped,
                    Some(reason.clone()),
                    Ok(WebhookOutcome::Dropped(reason)),
                )
            }
        };

        self.record_result(&event, result, error_message.as_deref())
            .await;

        outcome
    }

    /// Persist the processing result, retrying once.
    ///
    /// A record left in `processing` is reclaimed after the processing timeout, and the
    /// ledger's idempotency key keeps the re-run from applying twice.
    async fn record_result(
        &self,
        event: &PaymentEvent,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) {
        let strategy = FixedInterval::from_millis(100).take(1);
        let recorded = Retry::spawn(strategy, || {
            self.events.finish(&event.id, result, error_message)
        })
        .await;

        if let Err(e) = recorded {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                processing_result = result.as_str(),
                error = %e,
                "Failed to update webhook event record after retry; \
                 event stays in 'processing' until the claim times out"
            );
        }
    }

    async fn process(
        &self,
        event: &PaymentEvent,
        event_at: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let key = event.idempotency_key();
        match event.kind()? {
            EventKind::CheckoutCompleted(session) => {
                self.handle_checkout_completed(session, event_at, key)
                    .await
            }
            EventKind::SubscriptionUpdated(subscription) => {
                self.handle_subscription_updated(subscription, event_at, key)
                    .await
            }
            EventKind::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(subscription, event_at, key)
                    .await
            }
            EventKind::InvoicePaymentSucceeded(invoice) => {
                self.handle_invoice_paid(invoice, event_at, key).await
            }
            EventKind::Unhandled => Ok(WebhookOutcome::Ignored),
        }
    }

    async fn handle_checkout_completed(
        &self,
        session: CheckoutSessionObject,
        event_at: OffsetDateTime,
        key: String,
    ) -> BillingResult<WebhookOutcome> {
        let meta = EventMetadata::parse(&session.metadata)?;

        if !session.is_paid() {
            tracing::info!(
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "Checkout completed without payment, not crediting"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let mut mutation = if session.is_subscription() {
            let ordering = session.subscription.as_ref().map(|subscription_id| {
                EventOrdering::until_deleted(subscription_id.clone(), event_at)
            });
            if let Some(ordering) = &ordering {
                if self.already_past(ordering).await? {
                    tracing::info!(
                        session_id = %session.id,
                        subscription_id = %ordering.subscription_id,
                        "Subscription already deleted, skipping checkout"
                    );
                    return Ok(WebhookOutcome::Stale);
                }
            }
            let plan = self.resolve_plan(&meta, None).await?;
            let credits = meta.credit_amount.unwrap_or(plan.credits);
            let mutation = EntitlementMutation::set_balance(credits).subscription(plan.change);
            match ordering {
                Some(ordering) => mutation.ordered(ordering),
                None => mutation,
            }
        } else {
            let amount = meta.credit_amount.ok_or_else(|| {
                BillingError::MalformedEventMetadata("missing credit_amount".to_string())
            })?;
            EntitlementMutation::credit(amount)
        };

        if let Some(customer) = &session.customer {
            mutation = mutation.customer(customer.clone());
        }

        let receipt = self
            .ledger
            .apply(meta.account_id, mutation.idempotency_key(key))
            .await?;

        Ok(WebhookOutcome::from_receipt(receipt))
    }

    async fn handle_subscription_updated(
        &self,
        subscription: SubscriptionObject,
        event_at: OffsetDateTime,
        key: String,
    ) -> BillingResult<WebhookOutcome> {
        let meta = self
            .resolve_metadata(&subscription.metadata, subscription.customer.as_deref())
            .await?;

        let ordering = EventOrdering::latest(subscription.id.clone(), event_at);
        if self.already_past(&ordering).await? {
            tracing::info!(
                subscription_id = %subscription.id,
                status = %subscription.status,
                "Skipping stale subscription update"
            );
            return Ok(WebhookOutcome::Stale);
        }

        let mutation = if subscription.is_active() {
            let plan = self.resolve_plan(&meta, subscription.price_id()).await?;
            EntitlementMutation::set_balance(plan.credits).subscription(plan.change)
        } else {
            tracing::info!(
                subscription_id = %subscription.id,
                status = %subscription.status,
                account_id = %meta.account_id,
                "Subscription no longer active, revoking entitlement"
            );
            EntitlementMutation::set_balance(0).subscription(SubscriptionChange::cancelled())
        };

        let receipt = self
            .ledger
            .apply(
                meta.account_id,
                mutation.ordered(ordering).idempotency_key(key),
            )
            .await?;

        Ok(WebhookOutcome::from_receipt(receipt))
    }

    async fn handle_subscription_deleted(
        &self,
        subscription: SubscriptionObject,
        event_at: OffsetDateTime,
        key: String,
    ) -> BillingResult<WebhookOutcome> {
        let meta = self
            .resolve_metadata(&subscription.metadata, subscription.customer.as_deref())
            .await?;

        let mutation = EntitlementMutation::set_balance(0)
            .subscription(SubscriptionChange::cancelled())
            .ordered(EventOrdering::deletion(subscription.id.clone(), event_at))
            .idempotency_key(key);
        let receipt = self.ledger.apply(meta.account_id, mutation).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            account_id = %meta.account_id,
            "Subscription deleted"
        );

        Ok(WebhookOutcome::from_receipt(receipt))
    }

    async fn handle_invoice_paid(
        &self,
        invoice: InvoiceObject,
        event_at: OffsetDateTime,
        key: String,
    ) -> BillingResult<WebhookOutcome> {
        let Some(subscription_id) = invoice.subscription.clone() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice has no subscription, ignoring");
            return Ok(WebhookOutcome::Ignored);
        };

        let mut metadata = invoice.subscription_metadata().cloned().unwrap_or_default();
        if EventMetadata::account_id(&metadata)?.is_none() {
            let remote = self.gateway.subscription_metadata(&subscription_id).await?;
            for (k, v) in remote {
                metadata.entry(k).or_insert(v);
            }
        }
        let meta = self
            .resolve_metadata(&metadata, invoice.customer.as_deref())
            .await?;

        let ordering = EventOrdering::latest(subscription_id.clone(), event_at);
        if self.already_past(&ordering).await? {
            tracing::info!(
                invoice_id = %invoice.id,
                subscription_id = %subscription_id,
                "Skipping stale invoice payment"
            );
            return Ok(WebhookOutcome::Stale);
        }

        let plan = self.resolve_plan(&meta, invoice.price_id()).await?;
        let mutation = EntitlementMutation::set_balance(plan.credits)
            .subscription(plan.change)
            .ordered(ordering)
            .idempotency_key(key);
        let receipt = self.ledger.apply(meta.account_id, mutation).await?;
        if receipt.stale {
            return Ok(WebhookOutcome::Stale);
        }

        tracing::info!(
            invoice_id = %invoice.id,
            subscription_id = %subscription_id,
            billing_reason = ?invoice.billing_reason,
            credits = receipt.credits,
            "Subscription renewal applied"
        );

        Ok(WebhookOutcome::from_receipt(receipt))
    }

    /// Parse event metadata, falling back to the account linked to `customer`.
    async fn resolve_metadata(
        &self,
        metadata: &HashMap<String, String>,
        customer: Option<&str>,
    ) -> BillingResult<EventMetadata> {
        let fallback = match (EventMetadata::account_id(metadata)?, customer) {
            (None, Some(customer)) => self.ledger.account_for_customer(customer).await?,
            _ => None,
        };
        EventMetadata::parse_with_fallback(metadata, fallback)
    }

    /// Catalog lookup by item price, then plan id, then plan name.
    ///
    /// A plan missing from the catalog is granted by name when the event names both the plan
    /// and its credit amount.
    async fn resolve_plan(
        &self,
        meta: &EventMetadata,
        price_id: Option<&str>,
    ) -> BillingResult<GrantedPlan> {
        let mut plan = None;
        if let Some(price_id) = price_id {
            plan = self.catalog.plan_by_price_id(price_id).await?;
        }
        if plan.is_none() {
            if let Some(plan_id) = meta.plan_id {
                plan = self.catalog.plan_by_id(plan_id).await?;
            }
        }
        if plan.is_none() {
            if let Some(name) = &meta.plan_name {
                plan = self.catalog.plan_by_name(name).await?;
            }
        }

        match (plan, &meta.plan_name, meta.credit_amount) {
            (Some(plan), _, _) => Ok(GrantedPlan {
                credits: plan.credits,
                change: SubscriptionChange::active(plan.id, plan.name),
            }),
            (None, Some(name), Some(credits)) => {
                tracing::warn!(
                    plan_name = %name,
                    account_id = %meta.account_id,
                    "Plan not in catalog, granting by name"
                );
                Ok(GrantedPlan {
                    credits,
                    change: SubscriptionChange::unlinked(name.clone()),
                })
            }
            _ => Err(BillingError::MalformedEventMetadata(format!(
                "no plan matches price {:?}, plan_id {:?}, plan_name {:?}",
                price_id, meta.plan_id, meta.plan_name
            ))),
        }
    }

    /// Early read of the ordering guard; the ledger write checks it again under lock.
    async fn already_past(&self, ordering: &EventOrdering) -> BillingResult<bool> {
        let mark = self.ledger.watermark(&ordering.subscription_id).await?;
        Ok(ordering.is_stale(mark.as_ref()))
    }

    /// Events whose last processing attempt failed, newest first.
    pub async fn failed_events(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        self.events.list_failed(limit).await
    }

    /// Delete finished event records older than `retention_days`.
    pub async fn prune_events(&self, retention_days: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(retention_days);
        let pruned = self.events.prune(cutoff).await?;
        tracing::info!(
            pruned = pruned,
            retention_days = retention_days,
            "Pruned processed webhook events"
        );
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn header(timestamp: i64, payload: &str) -> String {
        format!("t={},v1={}", timestamp, sign_payload(SECRET, timestamp, payload).unwrap())
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        assert!(verify_signature(payload, &header(NOW, payload), SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn any_matching_v1_entry_is_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let good = sign_payload(SECRET, NOW, payload).unwrap();
        let header = format!("t={NOW},v1={},v1={good},v0=legacy", "00".repeat(32));
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let err = verify_signature(r#"{"id":"evt_2"}"#, &header(NOW, payload), SECRET, 300, NOW)
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    #[test]
    fn secret_prefix_is_part_of_the_key() {
        let payload = r#"{"id":"evt_1"}"#;
        let stripped = sign_payload("test_secret", NOW, payload).unwrap();
        let header = format!("t={NOW},v1={stripped}");
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_err());
    }

    #[test]
    fn old_timestamps_are_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = NOW - 301;
        assert!(matches!(
            verify_signature(payload, &header(signed_at, payload), SECRET, 300, NOW),
            Err(BillingError::InvalidSignature)
        ));
        assert!(verify_signature(payload, &header(NOW - 300, payload), SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let payload = "{}";
        let missing_signature = format!("t={NOW}");
        let min_timestamp = format!("t={},v1=00", i64::MIN);
        let max_timestamp = format!("t={},v1=00", i64::MAX);
        for header in [
            "",
            "t=abc,v1=00",
            "v1=00",
            missing_signature.as_str(),
            "garbage",
            min_timestamp.as_str(),
            max_timestamp.as_str(),
        ] {
            assert!(
                matches!(
                    verify_signature(payload, header, SECRET, 300, NOW),
                    Err(BillingError::InvalidSignature)
                ),
                "header {header:?} should be rejected"
            );
        }
    }
}
