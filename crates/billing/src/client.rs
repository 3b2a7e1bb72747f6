//! Stripe API client wrapper

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret key (sk_live_... or sk_test_...)
    pub secret_key: String,
    /// Webhook signing secret (whsec_...)
    pub webhook_secret: String,
    /// Accepted clock skew for signed webhook timestamps
    pub webhook_tolerance_secs: i64,
}

impl StripeConfig {
    pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let webhook_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config(format!("STRIPE_WEBHOOK_TOLERANCE_SECS is not a number: {raw}"))
            })?,
            Err(_) => Self::DEFAULT_WEBHOOK_TOLERANCE_SECS,
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            webhook_tolerance_secs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Payment,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutLineItem {
    /// A catalog price, used for subscriptions.
    Price { price_id: String },
    /// Ad-hoc credit purchase priced per credit.
    Credits {
        quantity: u64,
        unit_amount_cents: i64,
        currency: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionParams {
    pub mode: CheckoutMode,
    pub line_item: CheckoutLineItem,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub client_reference_id: String,
    /// Set on the session, and on the subscription it creates.
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostedCheckout {
    pub session_id: String,
    pub url: String,
}

/// Calls the ledger makes to the payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> BillingResult<HostedCheckout>;

    /// Metadata stored on a billing subscription.
    async fn subscription_metadata(
        &self,
        subscription_id: &str,
    ) -> BillingResult<HashMap<String, String>>;
}

/// Wrapper around the Stripe client
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
}

impl StripeClient {
    /// Create a new Stripe client
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: stripe::Client::new(&config.secret_key),
        }
    }
}

fn line_item(item: &CheckoutLineItem) -> BillingResult<stripe::CreateCheckoutSessionLineItems> {
    match item {
        CheckoutLineItem::Price { price_id } => Ok(stripe::CreateCheckoutSessionLineItems {
            price: Some(price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }),
        CheckoutLineItem::Credits {
            quantity,
            unit_amount_cents,
            currency,
        } => {
            let currency = currency
                .to_lowercase()
                .parse::<stripe::Currency>()
                .map_err(|_| BillingError::Config(format!("unsupported currency: {currency}")))?;
            Ok(stripe::CreateCheckoutSessionLineItems {
                quantity: Some(*quantity),
                price_data: Some(stripe::CreateCheckoutSessionLineItemsPriceData {
                    currency,
                    unit_amount: Some(*unit_amount_cents),
                    product_data: Some(
                        stripe::CreateCheckoutSessionLineItemsPriceDataProductData {
                            name: "Credits".to_string(),
                            ..Default::default()
                        },
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            })
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_checkout_session(
        &self,
        req: CheckoutSessionParams,
    ) -> BillingResult<HostedCheckout> {
        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(match req.mode {
            CheckoutMode::Payment => stripe::CheckoutSessionMode::Payment,
            CheckoutMode::Subscription => stripe::CheckoutSessionMode::Subscription,
        });
        params.success_url = Some(&req.success_url);
        params.cancel_url = Some(&req.cancel_url);
        params.client_reference_id = Some(&req.client_reference_id);

        if let Some(customer) = &req.customer_id {
            let customer = customer
                .parse::<stripe::CustomerId>()
                .map_err(|e| BillingError::InvalidInput(format!("customer id: {e}")))?;
            params.customer = Some(customer);
        } else if let Some(email) = &req.customer_email {
            params.customer_email = Some(email);
        }

        params.metadata = Some(req.metadata.clone());
        if req.mode == CheckoutMode::Subscription {
            params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
                metadata: Some(req.metadata.clone()),
                ..Default::default()
            });
        }
        params.line_items = Some(vec![line_item(&req.line_item)?]);

        let session = stripe::CheckoutSession::create(&self.client, params).await?;
        let url = session.url.ok_or_else(|| {
            BillingError::StripeApi("checkout session has no hosted URL".to_string())
        })?;

        tracing::info!(
            session_id = %session.id,
            mode = ?req.mode,
            "Created checkout session"
        );

        Ok(HostedCheckout {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn subscription_metadata(
        &self,
        subscription_id: &str,
    ) -> BillingResult<HashMap<String, String>> {
        let sub_id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("subscription id: {e}")))?;
        let subscription = stripe::Subscription::retrieve(&self.client, &sub_id, &[]).await?;
        Ok(subscription.metadata)
    }
}

/// Gateway that records requests and answers from canned data, for tests and local runs
/// without Stripe credentials.
#[derive(Default, Clone)]
pub struct MockPaymentGateway {
    pub created: Arc<Mutex<Vec<CheckoutSessionParams>>>,
    pub subscriptions: Arc<Mutex<HashMap<String, HashMap<String, String>>>>,
    pub fail_with: Arc<Mutex<Option<String>>>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(self, subscription_id: &str, metadata: HashMap<String, String>) -> Self {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(subscription_id.to_string(), metadata);
        }
        self
    }

    pub fn created_sessions(&self) -> Vec<CheckoutSessionParams> {
        self.created
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn injected_failure(&self) -> Option<BillingError> {
        self.fail_with
            .lock()
            .ok()
            .and_then(|f| f.clone())
            .map(BillingError::StripeApi)
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_checkout_session(
        &self,
        params: CheckoutSessionParams,
    ) -> BillingResult<HostedCheckout> {
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }
        let mut created = self
            .created
            .lock()
            .map_err(|_| BillingError::StripeApi("mock gateway poisoned".to_string()))?;
        created.push(params);
        let session_id = format!("cs_test_{}", created.len());
        Ok(HostedCheckout {
            url: format!("https://checkout.stripe.com/c/pay/{session_id}"),
            session_id,
        })
    }

    async fn subscription_metadata(
        &self,
        subscription_id: &str,
    ) -> BillingResult<HashMap<String, String>> {
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }
        Ok(self
            .subscriptions
            .lock()
            .ok()
            .and_then(|subs| subs.get(subscription_id).cloned())
            .unwrap_or_default())
    }
}
