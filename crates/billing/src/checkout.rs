//! Checkout session creation
//!
//! Creates hosted checkout sessions for subscriptions and one-time credit purchases. The
//! session carries the account and plan as metadata so the completion webhook can apply the
//! purchase without any other lookup.

use std::collections::HashMap;
use std::sync::Arc;

use creditledger_shared::AccountStatus;
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::client::{CheckoutLineItem, CheckoutMode, CheckoutSessionParams, PaymentGateway};
use crate::error::{BillingError, BillingResult};
use crate::events::{META_ACCOUNT_ID, META_CREDIT_AMOUNT, META_PLAN_ID, META_PLAN_NAME};
use crate::ledger::EntitlementLedger;
use crate::store::Catalog;

/// Upper bound on credits bought in one checkout.
pub const MAX_CREDIT_QUANTITY: i64 = 1_000_000;

/// Request to create a checkout session
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[serde(default)]
    pub price_id: Option<String>,
    #[serde(default)]
    pub credit_quantity: Option<i64>,
    pub mode: CheckoutMode,
    pub success_url: String,
    pub cancel_url: String,
}

/// Checkout session response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub url: String,
    pub session_id: String,
}

/// Checkout service for creating Stripe checkout sessions
pub struct CheckoutService {
    ledger: EntitlementLedger,
    catalog: Arc<dyn Catalog>,
    gateway: Arc<dyn PaymentGateway>,
}

impl CheckoutService {
    pub fn new(
        ledger: EntitlementLedger,
        catalog: Arc<dyn Catalog>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            gateway,
        }
    }

    /// Create a checkout session for `account_id` and return the hosted checkout URL.
    pub async fn create_session(
        &self,
        account_id: AccountId,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        validate_redirect("successUrl", &request.success_url)?;
        validate_redirect("cancelUrl", &request.cancel_url)?;

        let account = self.ledger.account(account_id).await?;
        if account.status == AccountStatus::Banned {
            return Err(BillingError::AccountBanned(account_id));
        }

        let mut metadata = HashMap::new();
        metadata.insert(META_ACCOUNT_ID.to_string(), account_id.to_string());

        let line_item = match request.mode {
            CheckoutMode::Subscription => {
                let price_id = request
                    .price_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        BillingError::InvalidInput("priceId is required for subscriptions".into())
                    })?;
                let plan = self
                    .catalog
                    .plan_by_price_id(price_id)
                    .await?
                    .ok_or_else(|| BillingError::PlanNotFound(price_id.to_string()))?;

                metadata.insert(META_PLAN_ID.to_string(), plan.id.to_string());
                metadata.insert(META_PLAN_NAME.to_string(), plan.name.clone());
                metadata.insert(META_CREDIT_AMOUNT.to_string(), plan.credits.to_string());

                CheckoutLineItem::Price {
                    price_id: plan.stripe_price_id,
                }
            }
            CheckoutMode::Payment => {
                let quantity = request.credit_quantity.ok_or_else(|| {
                    BillingError::InvalidInput("creditQuantity is required for payments".into())
                })?;
                if !(1..=MAX_CREDIT_QUANTITY).contains(&quantity) {
                    return Err(BillingError::InvalidInput(format!(
                        "creditQuantity must be between 1 and {}",
                        MAX_CREDIT_QUANTITY
                    )));
                }
                let pricing = self
                    .catalog
                    .credit_pricing()
                    .await?
                    .ok_or(BillingError::PricingNotConfigured)?;

                metadata.insert(META_CREDIT_AMOUNT.to_string(), quantity.to_string());

                CheckoutLineItem::Credits {
                    quantity: quantity as u64,
                    unit_amount_cents: pricing.price_per_credit_cents,
                    currency: pricing.currency,
                }
            }
        };

        let checkout = self
            .gateway
            .create_checkout_session(CheckoutSessionParams {
                mode: request.mode,
                line_item,
                success_url: request.success_url,
                cancel_url: request.cancel_url,
                customer_id: account.stripe_customer_id.clone(),
                customer_email: Some(account.email.clone()),
                client_reference_id: account_id.to_string(),
                metadata,
            })
            .await?;

        tracing::info!(
            account_id = %account_id,
            session_id = %checkout.session_id,
            mode = ?request.mode,
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            url: checkout.url,
            session_id: checkout.session_id,
        })
    }
}

fn validate_redirect(field: &str, url: &str) -> BillingResult<()> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(BillingError::InvalidInput(format!(
            "{} must be an absolute http(s) URL",
            field
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::client::MockPaymentGateway;
    use crate::store::{InMemoryAccountStore, InMemoryCatalog, SubscriptionPlan};
    use creditledger_shared::BillingCycle;
    use uuid::Uuid;

    struct Fixture {
        service: CheckoutService,
        gateway: MockPaymentGateway,
        account_id: Uuid,
        plan: SubscriptionPlan,
    }

    fn fixture(status: AccountStatus, customer: Option<&str>) -> Fixture {
        let account_id = Uuid::new_v4();
        let mut account = Account::new(account_id, "buyer@example.com");
        account.status = status;
        account.stripe_customer_id = customer.map(str::to_string);

        let plan = SubscriptionPlan {
            id: Uuid::new_v4(),
            name: "Pro".into(),
            credits: 500,
            price_cents: 2900,
            stripe_price_id: "price_pro".into(),
            billing_cycle: BillingCycle::Monthly,
        };
        let catalog = InMemoryCatalog::new()
            .with_plan(plan.clone())
            .with_pricing(5);
        let gateway = MockPaymentGateway::new();
        let ledger = EntitlementLedger::new(Arc::new(InMemoryAccountStore::with_accounts([
            account,
        ])));

        Fixture {
            service: CheckoutService::new(ledger, Arc::new(catalog), Arc::new(gateway.clone())),
            gateway,
            account_id,
            plan,
        }
    }

    fn request(mode: CheckoutMode) -> CheckoutRequest {
        CheckoutRequest {
            price_id: None,
            credit_quantity: None,
            mode,
            success_url: "https://app.example.com/billing/success".into(),
            cancel_url: "https://app.example.com/billing".into(),
        }
    }

    #[tokio::test]
    async fn subscription_checkout_carries_plan_metadata() {
        let f = fixture(AccountStatus::Active, Some("cus_123"));
        let mut req = request(CheckoutMode::Subscription);
        req.price_id = Some("price_pro".into());

        let response = f.service.create_session(f.account_id, req).await.unwrap();
        assert!(response.url.starts_with("https://"));

        let created = f.gateway.created_sessions();
        assert_eq!(created.len(), 1);
        let params = &created[0];
        assert_eq!(params.customer_id.as_deref(), Some("cus_123"));
        assert_eq!(
            params.metadata.get(META_ACCOUNT_ID),
            Some(&f.account_id.to_string())
        );
        assert_eq!(params.metadata.get(META_PLAN_ID), Some(&f.plan.id.to_string()));
        assert_eq!(params.metadata.get(META_PLAN_NAME).map(String::as_str), Some("Pro"));
        assert_eq!(
            params.metadata.get(META_CREDIT_AMOUNT).map(String::as_str),
            Some("500")
        );
    }

    #[tokio::test]
    async fn credit_purchase_is_priced_per_credit() {
        let f = fixture(AccountStatus::Active, None);
        let mut req = request(CheckoutMode::Payment);
        req.credit_quantity = Some(250);

        f.service.create_session(f.account_id, req).await.unwrap();

        let params = &f.gateway.created_sessions()[0];
        assert_eq!(
            params.line_item,
            CheckoutLineItem::Credits {
                quantity: 250,
                unit_amount_cents: 5,
                currency: "usd".into(),
            }
        );
        assert_eq!(params.customer_email.as_deref(), Some("buyer@example.com"));
        assert_eq!(
            params.metadata.get(META_CREDIT_AMOUNT).map(String::as_str),
            Some("250")
        );
    }

    #[tokio::test]
    async fn unknown_price_is_rejected() {
        let f = fixture(AccountStatus::Active, None);
        let mut req = request(CheckoutMode::Subscription);
        req.price_id = Some("price_missing".into());

        let err = f.service.create_session(f.account_id, req).await.unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound(_)));
        assert!(f.gateway.created_sessions().is_empty());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let f = fixture(AccountStatus::Active, None);

        let mut zero = request(CheckoutMode::Payment);
        zero.credit_quantity = Some(0);
        assert!(matches!(
            f.service.create_session(f.account_id, zero).await,
            Err(BillingError::InvalidInput(_))
        ));

        let mut relative = request(CheckoutMode::Payment);
        relative.credit_quantity = Some(10);
        relative.success_url = "/billing/success".into();
        assert!(matches!(
            f.service.create_session(f.account_id, relative).await,
            Err(BillingError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn banned_accounts_cannot_check_out() {
        let f = fixture(AccountStatus::Banned, None);
        let mut req = request(CheckoutMode::Payment);
        req.credit_quantity = Some(10);

        let err = f.service.create_session(f.account_id, req).await.unwrap_err();
        assert!(matches!(err, BillingError::AccountBanned(_)));
    }
}
