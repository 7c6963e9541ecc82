//! External collaborators consumed by the engine: clock, tax, coupons and
//! payments. Only the interfaces matter to the engine; the implementations
//! here are simple defaults for the binary and for tests.

use crate::error::{BillingError, BillingResult};
use crate::models::{Invoice, PaymentOutcome, TaxLocation};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use uuid::Uuid;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic renewal and proration runs.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Tax computed for an amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxQuote {
    pub rate: Decimal,
    pub amount: Decimal,
}

#[async_trait]
pub trait TaxCollaborator: Send + Sync {
    async fn compute_tax(&self, amount: Decimal, location: &TaxLocation)
        -> BillingResult<TaxQuote>;
}

/// Percentage tax by country, with a default for unknown countries.
#[derive(Debug, Clone, Default)]
pub struct FlatRateTax {
    default_rate: Decimal,
    rates: HashMap<String, Decimal>,
}

impl FlatRateTax {
    /// `default_rate` is a fraction, e.g. `0.08` for 8%.
    pub fn new(default_rate: Decimal) -> Self {
        Self {
            default_rate,
            rates: HashMap::new(),
        }
    }

    pub fn with_rate(mut self, country_code: &str, rate: Decimal) -> Self {
        self.rates.insert(country_code.to_uppercase(), rate);
        self
    }
}

#[async_trait]
impl TaxCollaborator for FlatRateTax {
    async fn compute_tax(
        &self,
        amount: Decimal,
        location: &TaxLocation,
    ) -> BillingResult<TaxQuote> {
        let rate = self
            .rates
            .get(&location.country_code.to_uppercase())
            .copied()
            .unwrap_or(self.default_rate);
        Ok(TaxQuote {
            rate,
            amount: amount * rate,
        })
    }
}

/// Discount granted by a coupon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponDiscount {
    pub discount_amount: Decimal,
}

#[async_trait]
pub trait CouponCollaborator: Send + Sync {
    async fn validate_and_reserve(
        &self,
        code: &str,
        user_id: Uuid,
        subtotal: Decimal,
    ) -> BillingResult<CouponDiscount>;
}

/// How a [`StaticCoupons`] code discounts a subtotal.
#[derive(Debug, Clone, Copy)]
pub enum CouponRule {
    AmountOff(Decimal),
    /// Fraction of the subtotal, e.g. `0.25`.
    PercentOff(Decimal),
}

/// Fixed table of coupon codes.
#[derive(Debug, Clone, Default)]
pub struct StaticCoupons {
    rules: HashMap<String, CouponRule>,
}

impl StaticCoupons {
    pub fn with_coupon(mut self, code: &str, rule: CouponRule) -> Self {
        self.rules.insert(code.to_string(), rule);
        self
    }
}

#[async_trait]
impl CouponCollaborator for StaticCoupons {
    async fn validate_and_reserve(
        &self,
        code: &str,
        _user_id: Uuid,
        subtotal: Decimal,
    ) -> BillingResult<CouponDiscount> {
        let rule = self
            .rules
            .get(code)
            .ok_or_else(|| BillingError::validation(format!("Unknown coupon code: {}", code)))?;
        let discount_amount = match rule {
            CouponRule::AmountOff(amount) => *amount,
            CouponRule::PercentOff(fraction) => subtotal * *fraction,
        };
        Ok(CouponDiscount {
            discount_amount: discount_amount.min(subtotal),
        })
    }
}

/// Payment gateway seen as a yes/no outcome.
#[async_trait]
pub trait PaymentCollaborator: Send + Sync {
    async fn collect(&self, invoice: &Invoice) -> BillingResult<PaymentOutcome>;
}

/// Bound a collaborator call by `deadline`. A timeout becomes
/// [`BillingError::Collaborator`], which aborts the enclosing transaction.
pub async fn with_deadline<T, F>(name: &str, deadline: std::time::Duration, call: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                collaborator = name,
                deadline_ms = deadline.as_millis() as u64,
                "Collaborator call timed out"
            );
            Err(BillingError::collaborator_timeout(name, deadline))
        }
    }
}
