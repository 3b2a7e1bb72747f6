//! Payment processor event payloads
//!
//! Only the fields the ledger acts on are deserialized. Stripe adds fields between API
//! versions, so everything else in the payload is ignored, and ids that may arrive expanded
//! into full objects are read either way.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";

/// Envelope of a webhook notification.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the processor created the event.
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl PaymentEvent {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidInput(format!("webhook payload: {}", e)))
    }

    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    /// Decode the event object for the event types the ledger handles.
    pub fn kind(&self) -> BillingResult<EventKind> {
        let object = self.data.object.clone();
        let kind = match self.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => EventKind::CheckoutCompleted(decode(object)?),
            SUBSCRIPTION_UPDATED => EventKind::SubscriptionUpdated(decode(object)?),
            SUBSCRIPTION_DELETED => EventKind::SubscriptionDeleted(decode(object)?),
            INVOICE_PAYMENT_SUCCEEDED => EventKind::InvoicePaymentSucceeded(decode(object)?),
            _ => EventKind::Unhandled,
        };
        Ok(kind)
    }

    pub fn is_handled(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            CHECKOUT_SESSION_COMPLETED
                | SUBSCRIPTION_UPDATED
                | SUBSCRIPTION_DELETED
                | INVOICE_PAYMENT_SUCCEEDED
        )
    }

    /// Key under which ledger mutations caused by this event are recorded.
    pub fn idempotency_key(&self) -> String {
        format!("stripe:{}", self.id)
    }
}

fn decode<T: for<'de> Deserialize<'de>>(object: serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(object)
        .map_err(|e| BillingError::MalformedEventMetadata(format!("event object: {}", e)))
}

#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSessionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    InvoicePaymentSucceeded(InvoiceObject),
    Unhandled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default, deserialize_with = "metadata_map")]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    pub fn is_subscription(&self) -> bool {
        self.mode.as_deref() == Some("subscription")
    }

    /// Sessions that completed without collecting payment (delayed methods) are not credited.
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            None | Some("paid") | Some("no_payment_required")
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "metadata_map")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: ItemList,
}

impl SubscriptionObject {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn price_id(&self) -> Option<&str> {
        self.items.first_price_id()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<LineItem>,
}

impl ItemList {
    fn first_price_id(&self) -> Option<&str> {
        self.data
            .iter()
            .find_map(|item| item.price.as_ref().map(|p| p.id.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItem {
    #[serde(default)]
    pub price: Option<PriceRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
    #[serde(default)]
    pub lines: ItemList,
}

impl InvoiceObject {
    pub fn subscription_metadata(&self) -> Option<&HashMap<String, String>> {
        self.subscription_details.as_ref().map(|d| &d.metadata)
    }

    pub fn price_id(&self) -> Option<&str> {
        self.lines.first_price_id()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default, deserialize_with = "metadata_map")]
    pub metadata: HashMap<String, String>,
}

/// Metadata attached at checkout-session creation and read back from events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    pub account_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub plan_name: Option<String>,
    pub credit_amount: Option<i64>,
}

pub const META_ACCOUNT_ID: &str = "account_id";
pub const META_PLAN_ID: &str = "plan_id";
pub const META_PLAN_NAME: &str = "plan_name";
pub const META_CREDIT_AMOUNT: &str = "credit_amount";

impl EventMetadata {
    pub fn parse(metadata: &HashMap<String, String>) -> BillingResult<Self> {
        Self::parse_with_fallback(metadata, None)
    }

    /// Like [`EventMetadata::parse`], using `fallback_account` when the metadata carries no
    /// account id.
    pub fn parse_with_fallback(
        metadata: &HashMap<String, String>,
        fallback_account: Option<Uuid>,
    ) -> BillingResult<Self> {
        let account_id = Self::account_id(metadata)?
            .or(fallback_account)
            .ok_or_else(|| {
                BillingError::MalformedEventMetadata("missing account_id".to_string())
            })?;

        let plan_id = non_empty(metadata, META_PLAN_ID)
            .map(|raw| {
                Uuid::parse_str(raw).map_err(|_| {
                    BillingError::MalformedEventMetadata(format!("invalid plan_id: {}", raw))
                })
            })
            .transpose()?;

        let credit_amount = non_empty(metadata, META_CREDIT_AMOUNT)
            .map(|raw| match raw.parse::<i64>() {
                Ok(amount) if amount >= 0 => Ok(amount),
                _ => Err(BillingError::MalformedEventMetadata(format!(
                    "invalid credit_amount: {}",
                    raw
                ))),
            })
            .transpose()?;

        Ok(Self {
            account_id,
            plan_id,
            plan_name: non_empty(metadata, META_PLAN_NAME).map(str::to_string),
            credit_amount,
        })
    }

    /// Reads only the account id; `Ok(None)` when it is absent.
    pub fn account_id(metadata: &HashMap<String, String>) -> BillingResult<Option<Uuid>> {
        non_empty(metadata, META_ACCOUNT_ID)
            .map(|raw| {
                Uuid::parse_str(raw).map_err(|_| {
                    BillingError::MalformedEventMetadata(format!("invalid account_id: {}", raw))
                })
            })
            .transpose()
    }
}

fn non_empty<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Accepts `"cus_123"`, `{"id": "cus_123", ...}` or `null`.
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    Ok(
        Option::<Expandable>::deserialize(deserializer)?.map(|e| match e {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }),
    )
}

fn metadata_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, object: serde_json::Value) -> PaymentEvent {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object },
        }))
        .unwrap()
    }

    #[test]
    fn checkout_session_reads_expanded_customer() {
        let e = event(
            CHECKOUT_SESSION_COMPLETED,
            json!({
                "id": "cs_1",
                "mode": "payment",
                "payment_status": "paid",
                "customer": { "id": "cus_9", "object": "customer" },
                "metadata": { "account_id": Uuid::nil().to_string(), "credit_amount": "100" },
            }),
        );
        match e.kind().unwrap() {
            EventKind::CheckoutCompleted(session) => {
                assert_eq!(session.customer.as_deref(), Some("cus_9"));
                assert!(session.is_paid());
                assert!(!session.is_subscription());
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(e.idempotency_key(), "stripe:evt_1");
    }

    #[test]
    fn unknown_types_are_unhandled() {
        let e = event("customer.created", json!({ "id": "cus_1" }));
        assert!(!e.is_handled());
        assert!(matches!(e.kind().unwrap(), EventKind::Unhandled));
    }

    #[test]
    fn subscription_price_comes_from_first_item() {
        let e = event(
            SUBSCRIPTION_UPDATED,
            json!({
                "id": "sub_1",
                "status": "active",
                "metadata": null,
                "items": { "data": [ { "price": { "id": "price_pro" } } ] },
            }),
        );
        match e.kind().unwrap() {
            EventKind::SubscriptionUpdated(sub) => {
                assert!(sub.is_active());
                assert_eq!(sub.price_id(), Some("price_pro"));
                assert!(sub.metadata.is_empty());
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn metadata_requires_account_id() {
        let mut metadata = HashMap::new();
        metadata.insert("plan_name".to_string(), "Pro".to_string());
        assert!(matches!(
            EventMetadata::parse(&metadata),
            Err(BillingError::MalformedEventMetadata(_))
        ));

        metadata.insert("account_id".to_string(), "not-a-uuid".to_string());
        assert!(matches!(
            EventMetadata::parse(&metadata),
            Err(BillingError::MalformedEventMetadata(_))
        ));
    }

    #[test]
    fn metadata_rejects_negative_credit_amount() {
        let mut metadata = HashMap::new();
        metadata.insert("account_id".to_string(), Uuid::new_v4().to_string());
        metadata.insert("credit_amount".to_string(), "-5".to_string());
        assert!(matches!(
            EventMetadata::parse(&metadata),
            Err(BillingError::MalformedEventMetadata(_))
        ));
    }

    #[test]
    fn metadata_parses_all_fields() {
        let account_id = Uuid::new_v4();
        let plan_id = Uuid::new_v4();
        let metadata: HashMap<String, String> = [
            ("account_id", account_id.to_string()),
            ("plan_id", plan_id.to_string()),
            ("plan_name", "Pro".to_string()),
            ("credit_amount", "500".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let parsed = EventMetadata::parse(&metadata).unwrap();
        assert_eq!(parsed.account_id, account_id);
        assert_eq!(parsed.plan_id, Some(plan_id));
        assert_eq!(parsed.plan_name.as_deref(), Some("Pro"));
        assert_eq!(parsed.credit_amount, Some(500));
    }
}
