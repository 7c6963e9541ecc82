//! Subscription aggregate.

use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Plan changes are only accepted from these states.
    pub fn accepts_plan_change(&self) -> bool {
        matches!(self, SubscriptionStatus::Trial | SubscriptionStatus::Active)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A downgrade staged to take effect at the next renewal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDowngrade {
    pub plan_id: Uuid,
    pub price: Decimal,
    pub effective_at: DateTime<Utc>,
}

/// Jurisdiction used for tax computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxLocation {
    pub country_code: String,
    pub state_code: Option<String>,
}

impl TaxLocation {
    pub fn new(country_code: impl Into<String>, state_code: Option<String>) -> Self {
        Self {
            country_code: country_code.into(),
            state_code,
        }
    }
}

/// Half-open billing window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> BillingResult<Self> {
        if end <= start {
            return Err(BillingError::validation(format!(
                "Billing period end {} must be after start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }
}

/// Subscription aggregate. `version` is bumped by exactly one on every
/// successful write and guards all mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    /// Price copied from the plan when it was assigned.
    pub price: Decimal,
    pub currency: String,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub pending_downgrade: Option<PendingDowngrade>,
    pub billing_location: Option<TaxLocation>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn is_canceled(&self) -> bool {
        self.status == SubscriptionStatus::Canceled
    }

    pub fn current_period(&self) -> BillingPeriod {
        BillingPeriod {
            start: self.current_period_start,
            end: self.current_period_end,
        }
    }

    /// Whether the renewal pass should act on this subscription at `now`.
    pub fn is_due_for_renewal(&self, now: DateTime<Utc>, lookahead: Duration) -> bool {
        !self.is_canceled() && self.current_period_end <= now + lookahead
    }

    /// Whether a trial has run out and is waiting to be converted.
    pub fn is_trial_ended(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Trial
            && self.trial_end.map(|end| end <= now).unwrap_or(false)
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub billing_location: Option<TaxLocation>,
}

/// Filter for the renewal scan.
#[derive(Debug, Clone)]
pub struct DueSubscriptionsFilter {
    pub period_end_before: DateTime<Utc>,
    pub limit: i64,
}
