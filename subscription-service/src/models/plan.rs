//! Plan catalog model.

use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Recurring period length of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Quarterly => "quarterly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingCycle::Monthly),
            "quarterly" => Some(BillingCycle::Quarterly),
            "yearly" => Some(BillingCycle::Yearly),
            _ => None,
        }
    }

    /// Calendar months covered by one cycle.
    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Quarterly => 3,
            BillingCycle::Yearly => 12,
        }
    }

    /// Flat day count used to derive a daily rate.
    ///
    /// This is deliberately not calendar-accurate: a monthly plan is always
    /// treated as 30 days, so proration in February and in 31-day months is
    /// slightly off. Billing code that needs exact calendar proration must
    /// not rely on it.
    pub fn proration_days(&self) -> Decimal {
        match self {
            BillingCycle::Monthly => Decimal::from(30),
            BillingCycle::Quarterly => Decimal::from(90),
            BillingCycle::Yearly => Decimal::from(365),
        }
    }

    /// End of the cycle that starts at `start`.
    pub fn period_end(&self, start: DateTime<Utc>) -> BillingResult<DateTime<Utc>> {
        start
            .checked_add_months(Months::new(self.months()))
            .ok_or_else(|| {
                BillingError::validation(format!(
                    "{} period starting at {} is out of range",
                    self, start
                ))
            })
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable plan. Price changes are made by creating a new plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub trial_days: i32,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl Plan {
    pub fn has_trial(&self) -> bool {
        self.trial_days > 0
    }

    /// Reject plans that can no longer be assigned.
    pub fn ensure_active(&self) -> BillingResult<()> {
        if !self.is_active {
            return Err(BillingError::validation(format!(
                "Plan {} is not active",
                self.plan_id
            )));
        }
        Ok(())
    }
}

/// Input for creating a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub price: Decimal,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub trial_days: i32,
}

impl CreatePlan {
    pub fn validate(&self) -> BillingResult<()> {
        if self.name.trim().is_empty() {
            return Err(BillingError::validation("Plan name is required"));
        }
        if self.price < Decimal::ZERO {
            return Err(BillingError::validation("Plan price cannot be negative"));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(BillingError::validation(format!(
                "Invalid currency code: {}",
                self.currency
            )));
        }
        if self.trial_days < 0 {
            return Err(BillingError::validation("Trial days cannot be negative"));
        }
        Ok(())
    }
}
