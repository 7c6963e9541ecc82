//! Append-only subscription audit trail.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle action recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Upgraded,
    Downgraded,
    Canceled,
    Renewed,
    TrialConverted,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Created => "created",
            HistoryAction::Upgraded => "upgraded",
            HistoryAction::Downgraded => "downgraded",
            HistoryAction::Canceled => "canceled",
            HistoryAction::Renewed => "renewed",
            HistoryAction::TrialConverted => "trial_converted",
        }
    }
}

/// History row. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionHistory {
    pub history_id: Uuid,
    pub subscription_id: Uuid,
    pub action: HistoryAction,
    pub previous_plan_id: Option<Uuid>,
    pub new_plan_id: Uuid,
    pub previous_price: Option<Decimal>,
    pub new_price: Decimal,
    pub proration_amount: Decimal,
    pub created_utc: DateTime<Utc>,
}

impl SubscriptionHistory {
    /// Record `action` moving a subscription from the `(plan, price)` pair
    /// in `before` (absent on creation) to the one in `after`.
    pub fn record(
        subscription_id: Uuid,
        action: HistoryAction,
        before: Option<(Uuid, Decimal)>,
        after: (Uuid, Decimal),
        proration_amount: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            history_id: Uuid::new_v4(),
            subscription_id,
            action,
            previous_plan_id: before.map(|(plan_id, _)| plan_id),
            new_plan_id: after.0,
            previous_price: before.map(|(_, price)| price),
            new_price: after.1,
            proration_amount,
            created_utc: at,
        }
    }
}
