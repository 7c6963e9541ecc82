//! Invoice Assembler: turns amounts from the lifecycle manager into invoices
//! with tax, and applies coupons to open invoices.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingPeriod, Invoice, InvoiceItem, InvoiceKind, InvoiceStatus, Subscription, TaxLocation,
};
use crate::services::collaborators::{with_deadline, Clock, CouponCollaborator, TaxCollaborator};
use crate::services::proration::round_money;
use crate::services::store::{BillingStore, BillingTx};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InvoiceConfig {
    /// Days between invoice date and due date.
    pub due_days: i64,
    /// Jurisdiction taxed when the subscription has no billing location.
    pub fallback_location: TaxLocation,
    pub collaborator_timeout: std::time::Duration,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            due_days: 7,
            fallback_location: TaxLocation::new("US", None),
            collaborator_timeout: std::time::Duration::from_secs(5),
        }
    }
}

pub trait InvoiceNumberGenerator: Send + Sync {
    fn generate(&self, at: DateTime<Utc>) -> String;
}

/// `INV-{YYYY}{MM}-{NNNN}` with a random four-digit suffix.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomInvoiceNumbers;

impl InvoiceNumberGenerator for RandomInvoiceNumbers {
    fn generate(&self, at: DateTime<Utc>) -> String {
        let mut rng = rand::thread_rng();
        format!("INV-{}-{:04}", at.format("%Y%m"), rng.gen_range(0..10_000))
    }
}

/// One line to bill.
struct Charge<'a> {
    kind: InvoiceKind,
    amount: Decimal,
    description: String,
    period: BillingPeriod,
    subscription: &'a Subscription,
}

pub struct InvoiceAssembler {
    store: Arc<dyn BillingStore>,
    tax: Arc<dyn TaxCollaborator>,
    coupons: Arc<dyn CouponCollaborator>,
    clock: Arc<dyn Clock>,
    numbers: Arc<dyn InvoiceNumberGenerator>,
    config: InvoiceConfig,
}

impl InvoiceAssembler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        tax: Arc<dyn TaxCollaborator>,
        coupons: Arc<dyn CouponCollaborator>,
        clock: Arc<dyn Clock>,
        config: InvoiceConfig,
    ) -> Self {
        Self {
            store,
            tax,
            coupons,
            clock,
            numbers: Arc::new(RandomInvoiceNumbers),
            config,
        }
    }

    pub fn with_number_generator(mut self, numbers: Arc<dyn InvoiceNumberGenerator>) -> Self {
        self.numbers = numbers;
        self
    }

    fn tax_location(&self, subscription: &Subscription) -> TaxLocation {
        subscription
            .billing_location
            .clone()
            .unwrap_or_else(|| self.config.fallback_location.clone())
    }

    async fn tax_for(&self, amount: Decimal, location: &TaxLocation) -> BillingResult<Decimal> {
        let quote = with_deadline(
            "tax",
            self.config.collaborator_timeout,
            self.tax.compute_tax(amount, location),
        )
        .await?;
        Ok(round_money(quote.amount).max(Decimal::ZERO))
    }

    /// Full-price invoice for `period`, written inside `tx`.
    pub async fn create_subscription_invoice(
        &self,
        tx: &mut dyn BillingTx,
        subscription: &Subscription,
        period: BillingPeriod,
    ) -> BillingResult<Invoice> {
        let charge = Charge {
            kind: InvoiceKind::Subscription,
            amount: subscription.price,
            description: format!(
                "Subscription {} to {}",
                period.start.date_naive(),
                period.end.date_naive()
            ),
            period,
            subscription,
        };
        self.issue(tx, charge).await
    }

    /// Invoice for a mid-cycle upgrade or trial conversion covering `window`.
    pub async fn create_proration_invoice(
        &self,
        tx: &mut dyn BillingTx,
        subscription: &Subscription,
        amount: Decimal,
        window: BillingPeriod,
    ) -> BillingResult<Invoice> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::validation(
                "Proration invoice amount must be positive",
            ));
        }
        let charge = Charge {
            kind: InvoiceKind::Proration,
            amount,
            description: format!(
                "Proration {} to {}",
                window.start.date_naive(),
                window.end.date_naive()
            ),
            period: window,
            subscription,
        };
        self.issue(tx, charge).await
    }

    #[instrument(skip(self, tx, charge), fields(subscription_id = %charge.subscription.subscription_id, kind = charge.kind.as_str()))]
    async fn issue(&self, tx: &mut dyn BillingTx, charge: Charge<'_>) -> BillingResult<Invoice> {
        let now = self.clock.now();
        let subscription = charge.subscription;
        let subtotal = round_money(charge.amount);
        let location = self.tax_location(subscription);
        let tax_amount = self.tax_for(subtotal, &location).await?;

        let mut invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            invoice_number: self.numbers.generate(now),
            user_id: subscription.user_id,
            subscription_id: subscription.subscription_id,
            kind: charge.kind,
            status: InvoiceStatus::Open,
            subtotal,
            tax_amount,
            discount_amount: Decimal::ZERO,
            total: Decimal::ZERO,
            amount_paid: Decimal::ZERO,
            amount_due: Decimal::ZERO,
            currency: subscription.currency.clone(),
            coupon_code: None,
            payment_attempts: 0,
            next_payment_attempt_at: None,
            invoice_date: now,
            due_date: now + Duration::days(self.config.due_days),
            created_utc: now,
            updated_utc: now,
        };
        invoice.recalculate_totals();
        if invoice.amount_due > Decimal::ZERO {
            invoice.next_payment_attempt_at = Some(now);
        }

        let item = InvoiceItem {
            item_id: Uuid::new_v4(),
            invoice_id: invoice.invoice_id,
            description: charge.description,
            quantity: Decimal::ONE,
            unit_price: subtotal,
            amount: subtotal,
            is_proration: charge.kind == InvoiceKind::Proration,
            period_start: Some(charge.period.start),
            period_end: Some(charge.period.end),
            created_utc: now,
        };

        tx.insert_invoice(&invoice).await?;
        tx.insert_invoice_item(&item).await?;

        info!(
            invoice_id = %invoice.invoice_id,
            invoice_number = %invoice.invoice_number,
            subtotal = %invoice.subtotal,
            tax = %invoice.tax_amount,
            total = %invoice.total,
            "Invoice created"
        );
        Ok(invoice)
    }

    /// Apply `code` to an open or draft invoice in its own transaction.
    ///
    /// Re-applying the code already on the invoice returns the invoice
    /// unchanged and does not consume another redemption.
    #[instrument(skip(self))]
    pub async fn apply_coupon(&self, invoice_id: Uuid, code: &str) -> BillingResult<Invoice> {
        let mut tx = self.store.begin().await?;

        let mut invoice = tx
            .get_invoice_for_update(invoice_id)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("Invoice {} not found", invoice_id)))?;

        if !invoice.status.is_unsettled() {
            return Err(BillingError::validation(format!(
                "Coupons can only be applied to draft or open invoices, invoice {} is {}",
                invoice_id, invoice.status
            )));
        }
        match invoice.coupon_code.as_deref() {
            Some(existing) if existing == code => {
                tx.rollback().await?;
                return Ok(invoice);
            }
            Some(existing) => {
                return Err(BillingError::validation(format!(
                    "Invoice {} already has coupon {}",
                    invoice_id, existing
                )));
            }
            None => {}
        }

        // Row lock serializes concurrent redemptions of the same code.
        let coupon = tx
            .get_coupon_for_update(code)
            .await?
            .ok_or_else(|| BillingError::validation(format!("Unknown coupon code: {}", code)))?;
        if !coupon.is_active || coupon.redemptions_remaining <= 0 {
            return Err(BillingError::validation(format!(
                "Coupon {} is no longer redeemable",
                code
            )));
        }

        let discount = with_deadline(
            "coupon",
            self.config.collaborator_timeout,
            self.coupons
                .validate_and_reserve(code, invoice.user_id, invoice.subtotal),
        )
        .await?;
        let discount_amount = round_money(discount.discount_amount)
            .max(Decimal::ZERO)
            .min(invoice.subtotal);

        let location = match tx.get_subscription_for_update(invoice.subscription_id).await? {
            Some(subscription) => self.tax_location(&subscription),
            None => self.config.fallback_location.clone(),
        };
        let tax_amount = self
            .tax_for(invoice.subtotal - discount_amount, &location)
            .await?;

        invoice.discount_amount = discount_amount;
        invoice.tax_amount = tax_amount;
        invoice.coupon_code = Some(code.to_string());
        invoice.updated_utc = self.clock.now();
        invoice.recalculate_totals();
        if invoice.amount_due == Decimal::ZERO {
            invoice.next_payment_attempt_at = None;
        }

        tx.update_invoice(&invoice).await?;
        tx.decrement_coupon_redemptions(code).await?;
        tx.commit().await?;

        info!(
            invoice_id = %invoice_id,
            code = code,
            discount = %discount_amount,
            total = %invoice.total,
            "Coupon applied"
        );
        Ok(invoice)
    }

    /// Void a draft or open invoice. Voiding a void invoice is a no-op.
    #[instrument(skip(self))]
    pub async fn void_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut tx = self.store.begin().await?;
        let mut invoice = tx
            .get_invoice_for_update(invoice_id)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("Invoice {} not found", invoice_id)))?;

        if invoice.status == InvoiceStatus::Void {
            tx.rollback().await?;
            return Ok(invoice);
        }
        if !invoice.status.is_unsettled() {
            return Err(BillingError::validation(format!(
                "Invoice {} is {} and cannot be voided",
                invoice_id, invoice.status
            )));
        }

        invoice.status = InvoiceStatus::Void;
        invoice.amount_due = Decimal::ZERO;
        invoice.next_payment_attempt_at = None;
        invoice.updated_utc = self.clock.now();
        tx.update_invoice(&invoice).await?;
        tx.commit().await?;

        info!(invoice_id = %invoice_id, "Invoice voided");
        Ok(invoice)
    }
}
