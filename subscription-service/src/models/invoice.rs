//! Invoice, line item and coupon models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Uncollectible => "uncollectible",
        }
    }

    /// Coupons and voiding are only allowed before settlement.
    pub fn is_unsettled(&self) -> bool {
        matches!(self, InvoiceStatus::Draft | InvoiceStatus::Open)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What an invoice charges for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    Subscription,
    Proration,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Subscription => "subscription",
            InvoiceKind::Proration => "proration",
        }
    }
}

/// Invoice header.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub kind: InvoiceKind,
    pub status: InvoiceStatus,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub amount_paid: Decimal,
    pub amount_due: Decimal,
    pub currency: String,
    pub coupon_code: Option<String>,
    pub payment_attempts: i32,
    pub next_payment_attempt_at: Option<DateTime<Utc>>,
    pub invoice_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    /// Recompute `total` and `amount_due` from the component amounts.
    pub fn recalculate_totals(&mut self) {
        self.total = self.subtotal - self.discount_amount + self.tax_amount;
        self.amount_due = (self.total - self.amount_paid).max(Decimal::ZERO);
    }
}

/// Line item. Immutable once the parent invoice leaves draft.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceItem {
    pub item_id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
    pub is_proration: bool,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

/// Coupon redemption counter row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Coupon {
    pub code: String,
    pub redemptions_remaining: i32,
    pub is_active: bool,
}

/// Result of a payment attempt reported by the payment collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Declined { reason: String },
}
