//! Subscription Lifecycle Manager.
//!
//! Owns the subscription state machine. Every operation runs in one
//! transaction: the subscription write (through [`mutate`]), the history row
//! and any invoice commit together or not at all.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingCycle, BillingPeriod, CreateSubscription, HistoryAction, Invoice, InvoiceStatus,
    PaymentOutcome, PendingDowngrade, Plan, Subscription, SubscriptionHistory,
    SubscriptionStatus,
};
use crate::services::collaborators::Clock;
use crate::services::concurrency::mutate;
use crate::services::invoice::InvoiceAssembler;
use crate::services::metrics::{record_error, record_invoice, record_operation};
use crate::services::proration::{
    cancellation_refund, downgrade_credit, grace_period_proration, trial_conversion_proration,
    DEFAULT_GRACE_PERIOD_HOURS,
};
use crate::services::store::{BillingStore, BillingTx};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Plan changes this close to the period start are free.
    pub grace_period: Duration,
    /// Subscriptions whose period ends within this window count as due.
    pub renewal_lookahead: Duration,
    /// Declines after which an invoice is written off.
    pub payment_max_attempts: i32,
    pub payment_retry_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::hours(DEFAULT_GRACE_PERIOD_HOURS),
            renewal_lookahead: Duration::zero(),
            payment_max_attempts: 3,
            payment_retry_interval: Duration::hours(24),
        }
    }
}

/// Result of an upgrade or a scheduled downgrade.
#[derive(Debug, Clone)]
pub struct PlanChangeOutcome {
    pub subscription: Subscription,
    /// Charge for an upgrade; signed credit estimate for a downgrade.
    pub proration_amount: Decimal,
    pub invoice: Option<Invoice>,
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub subscription: Subscription,
    /// Unused-period credit for an immediate cancel. Reported, never paid out.
    pub refund_estimate: Decimal,
}

#[derive(Debug, Clone)]
pub enum RenewalOutcome {
    /// Period end is still in the future or the subscription is canceled.
    NotDue(Subscription),
    /// A deferred cancel took effect.
    Canceled(Subscription),
    Renewed {
        subscription: Subscription,
        invoice: Invoice,
    },
}

#[derive(Debug, Clone)]
pub enum TrialConversionOutcome {
    NotEnded(Subscription),
    Converted {
        subscription: Subscription,
        invoice: Option<Invoice>,
    },
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    AlreadySettled(Invoice),
    Paid(Invoice),
    /// Declined with attempts left; retried at `next_payment_attempt_at`.
    RetryScheduled(Invoice),
    /// Declined for the last time; the subscription was canceled.
    Uncollectible(Invoice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanChangeKind {
    Upgrade,
    Downgrade,
}

#[derive(Debug, Clone)]
pub struct PlanChangePreview {
    pub kind: PlanChangeKind,
    /// What [`SubscriptionManager::upgrade`] would charge now, or the
    /// (negative) credit a downgrade represents.
    pub amount: Decimal,
}

enum RenewalStep {
    Canceled { before: (Uuid, Decimal) },
    Renewed { before: (Uuid, Decimal) },
}

fn observe<T>(operation: &str, result: BillingResult<T>) -> BillingResult<T> {
    match &result {
        Ok(_) => record_operation(operation),
        Err(e) => record_error(e.kind(), operation),
    }
    result
}

fn plan_not_found(plan_id: Uuid) -> BillingError {
    BillingError::validation(format!("Plan {} not found", plan_id))
}

fn subscription_not_found(subscription_id: Uuid) -> BillingError {
    BillingError::not_found(format!("Subscription {} not found", subscription_id))
}

/// Checks shared by upgrade, downgrade and preview.
fn check_plan_change(
    subscription: &Subscription,
    current: &Plan,
    target: &Plan,
) -> BillingResult<()> {
    if !subscription.status.accepts_plan_change() {
        return Err(BillingError::validation(format!(
            "Subscription {} is {} and cannot change plans",
            subscription.subscription_id, subscription.status
        )));
    }
    target.ensure_active()?;
    if target.plan_id == subscription.plan_id {
        return Err(BillingError::validation(format!(
            "Subscription {} is already on plan {}",
            subscription.subscription_id, target.plan_id
        )));
    }
    if current.billing_cycle != target.billing_cycle {
        return Err(BillingError::BillingCycleMismatch {
            current: current.billing_cycle.to_string(),
            requested: target.billing_cycle.to_string(),
        });
    }
    if target.currency != subscription.currency {
        return Err(BillingError::validation(format!(
            "Plan currency {} does not match subscription currency {}",
            target.currency, subscription.currency
        )));
    }
    Ok(())
}

pub struct SubscriptionManager {
    store: Arc<dyn BillingStore>,
    invoices: Arc<InvoiceAssembler>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn BillingStore>,
        invoices: Arc<InvoiceAssembler>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            invoices,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Committed state of a subscription.
    pub async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| subscription_not_found(subscription_id))
    }

    pub async fn list_history(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionHistory>> {
        self.store.list_history(subscription_id).await
    }

    async fn lock_subscription(
        tx: &mut dyn BillingTx,
        subscription_id: Uuid,
    ) -> BillingResult<Subscription> {
        tx.get_subscription_for_update(subscription_id)
            .await?
            .ok_or_else(|| subscription_not_found(subscription_id))
    }

    async fn current_plan(tx: &mut dyn BillingTx, subscription: &Subscription) -> BillingResult<Plan> {
        tx.get_plan(subscription.plan_id).await?.ok_or_else(|| {
            BillingError::not_found(format!(
                "Plan {} of subscription {} not found",
                subscription.plan_id, subscription.subscription_id
            ))
        })
    }

    /// Start a subscription. Plans with a trial start in `trial` and buy
    /// their first full cycle from the trial end; other plans start `active`
    /// and are invoiced for the first period right away.
    #[instrument(skip(self, input), fields(user_id = %input.user_id, plan_id = %input.plan_id))]
    pub async fn create(&self, input: CreateSubscription) -> BillingResult<Subscription> {
        observe("create", self.create_subscription(input).await)
    }

    async fn create_subscription(&self, input: CreateSubscription) -> BillingResult<Subscription> {
        if let Some(location) = &input.billing_location {
            if location.country_code.len() != 2 {
                return Err(BillingError::validation(format!(
                    "Invalid country code: {}",
                    location.country_code
                )));
            }
        }

        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let plan = tx
            .get_plan(input.plan_id)
            .await?
            .ok_or_else(|| plan_not_found(input.plan_id))?;
        plan.ensure_active()?;

        if tx
            .find_live_subscription_for_user(input.user_id)
            .await?
            .is_some()
        {
            return Err(BillingError::DuplicateSubscription(input.user_id));
        }

        let trial_end = plan
            .has_trial()
            .then(|| now + Duration::days(i64::from(plan.trial_days)));
        let current_period_end = plan.billing_cycle.period_end(trial_end.unwrap_or(now))?;
        let status = if trial_end.is_some() {
            SubscriptionStatus::Trial
        } else {
            SubscriptionStatus::Active
        };

        let subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            user_id: input.user_id,
            plan_id: plan.plan_id,
            status,
            current_period_start: now,
            current_period_end,
            trial_end,
            price: plan.price,
            currency: plan.currency.clone(),
            cancel_at_period_end: false,
            canceled_at: None,
            version: 0,
            pending_downgrade: None,
            billing_location: input.billing_location,
            created_utc: now,
            updated_utc: now,
        };

        tx.insert_subscription(&subscription).await?;
        tx.insert_history(&SubscriptionHistory::record(
            subscription.subscription_id,
            HistoryAction::Created,
            None,
            (plan.plan_id, plan.price),
            Decimal::ZERO,
            now,
        ))
        .await?;

        let invoice = if trial_end.is_none() && plan.price > Decimal::ZERO {
            Some(
                self.invoices
                    .create_subscription_invoice(
                        tx.as_mut(),
                        &subscription,
                        subscription.current_period(),
                    )
                    .await?,
            )
        } else {
            None
        };

        tx.commit().await?;
        if let Some(invoice) = &invoice {
            record_invoice(invoice.kind.as_str(), &invoice.currency, invoice.total);
        }

        info!(
            subscription_id = %subscription.subscription_id,
            status = %subscription.status,
            period_end = %subscription.current_period_end,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// Move to a plan on the same cycle now, billing the prorated difference.
    #[instrument(skip(self))]
    pub async fn upgrade(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<PlanChangeOutcome> {
        observe(
            "upgrade",
            self.apply_upgrade(subscription_id, new_plan_id, expected_version)
                .await,
        )
    }

    async fn apply_upgrade(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<PlanChangeOutcome> {
        let now = self.clock.now();
        let grace = self.config.grace_period;
        let mut tx = self.store.begin().await?;

        let target = tx
            .get_plan(new_plan_id)
            .await?
            .ok_or_else(|| plan_not_found(new_plan_id))?;
        let locked = Self::lock_subscription(tx.as_mut(), subscription_id).await?;
        let current = Self::current_plan(tx.as_mut(), &locked).await?;

        let (subscription, (before, amount)) =
            mutate(tx.as_mut(), subscription_id, expected_version, |s| {
                check_plan_change(s, &current, &target)?;
                // Nothing has been billed during a trial.
                let amount = if s.status == SubscriptionStatus::Trial {
                    Decimal::ZERO
                } else {
                    grace_period_proration(
                        s.price,
                        target.price,
                        current.billing_cycle,
                        &s.current_period(),
                        now,
                        grace,
                    )
                };
                let before = (s.plan_id, s.price);
                s.plan_id = target.plan_id;
                s.price = target.price;
                s.pending_downgrade = None;
                s.updated_utc = now;
                Ok((before, amount))
            })
            .await?;

        tx.insert_history(&SubscriptionHistory::record(
            subscription_id,
            HistoryAction::Upgraded,
            Some(before),
            (subscription.plan_id, subscription.price),
            amount,
            now,
        ))
        .await?;

        let invoice = if amount > Decimal::ZERO {
            let window = BillingPeriod::new(
                now.max(subscription.current_period_start),
                subscription.current_period_end,
            )?;
            Some(
                self.invoices
                    .create_proration_invoice(tx.as_mut(), &subscription, amount, window)
                    .await?,
            )
        } else {
            None
        };

        tx.commit().await?;
        if let Some(invoice) = &invoice {
            record_invoice(invoice.kind.as_str(), &invoice.currency, invoice.total);
        }

        info!(
            subscription_id = %subscription_id,
            from_plan = %before.0,
            to_plan = %subscription.plan_id,
            proration = %amount,
            version = subscription.version,
            "Subscription upgraded"
        );
        Ok(PlanChangeOutcome {
            subscription,
            proration_amount: amount,
            invoice,
        })
    }

    /// Schedule a move to a cheaper plan at the end of the current period.
    /// Nothing is charged or credited now.
    #[instrument(skip(self))]
    pub async fn downgrade(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<PlanChangeOutcome> {
        observe(
            "downgrade",
            self.schedule_downgrade(subscription_id, new_plan_id, expected_version)
                .await,
        )
    }

    async fn schedule_downgrade(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<PlanChangeOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let target = tx
            .get_plan(new_plan_id)
            .await?
            .ok_or_else(|| plan_not_found(new_plan_id))?;
        let locked = Self::lock_subscription(tx.as_mut(), subscription_id).await?;
        let current = Self::current_plan(tx.as_mut(), &locked).await?;

        let (subscription, (before, credit)) =
            mutate(tx.as_mut(), subscription_id, expected_version, |s| {
                check_plan_change(s, &current, &target)?;
                if target.price >= s.price {
                    return Err(BillingError::validation(format!(
                        "Plan {} is not cheaper than the current price {}",
                        target.plan_id, s.price
                    )));
                }
                let credit = downgrade_credit(
                    s.price,
                    target.price,
                    current.billing_cycle,
                    &s.current_period(),
                    now,
                );
                s.pending_downgrade = Some(PendingDowngrade {
                    plan_id: target.plan_id,
                    price: target.price,
                    effective_at: s.current_period_end,
                });
                s.updated_utc = now;
                Ok(((s.plan_id, s.price), credit))
            })
            .await?;

        tx.insert_history(&SubscriptionHistory::record(
            subscription_id,
            HistoryAction::Downgraded,
            Some(before),
            (target.plan_id, target.price),
            credit,
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(
            subscription_id = %subscription_id,
            to_plan = %target.plan_id,
            effective_at = %subscription.current_period_end,
            "Downgrade scheduled"
        );
        Ok(PlanChangeOutcome {
            subscription,
            proration_amount: credit,
            invoice: None,
        })
    }

    /// Cancel now, or at the end of the current period. Canceling a canceled
    /// subscription succeeds without writing anything.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        immediate: bool,
        expected_version: i64,
    ) -> BillingResult<CancelOutcome> {
        observe(
            "cancel",
            self.apply_cancel(subscription_id, immediate, expected_version)
                .await,
        )
    }

    async fn apply_cancel(
        &self,
        subscription_id: Uuid,
        immediate: bool,
        expected_version: i64,
    ) -> BillingResult<CancelOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let locked = Self::lock_subscription(tx.as_mut(), subscription_id).await?;
        if locked.is_canceled() || (!immediate && locked.cancel_at_period_end) {
            tx.rollback().await?;
            return Ok(CancelOutcome {
                subscription: locked,
                refund_estimate: Decimal::ZERO,
            });
        }

        if !immediate {
            let (subscription, ()) =
                mutate(tx.as_mut(), subscription_id, expected_version, |s| {
                    s.cancel_at_period_end = true;
                    s.canceled_at = Some(now);
                    s.updated_utc = now;
                    Ok(())
                })
                .await?;
            tx.commit().await?;

            info!(
                subscription_id = %subscription_id,
                effective_at = %subscription.current_period_end,
                "Cancellation scheduled"
            );
            return Ok(CancelOutcome {
                subscription,
                refund_estimate: Decimal::ZERO,
            });
        }

        let cycle = Self::current_plan(tx.as_mut(), &locked).await?.billing_cycle;
        let (subscription, refund) =
            mutate(tx.as_mut(), subscription_id, expected_version, |s| {
                // Nothing has been billed during a trial.
                let refund = if s.status == SubscriptionStatus::Trial {
                    Decimal::ZERO
                } else {
                    cancellation_refund(s.price, cycle, &s.current_period(), now)
                };
                s.status = SubscriptionStatus::Canceled;
                s.canceled_at = Some(now);
                s.pending_downgrade = None;
                s.updated_utc = now;
                Ok(refund)
            })
            .await?;

        // Credits are recorded as negative amounts.
        tx.insert_history(&SubscriptionHistory::record(
            subscription_id,
            HistoryAction::Canceled,
            Some((locked.plan_id, locked.price)),
            (subscription.plan_id, subscription.price),
            -refund,
            now,
        ))
        .await?;
        tx.commit().await?;

        info!(
            subscription_id = %subscription_id,
            refund_estimate = %refund,
            "Subscription canceled"
        );
        Ok(CancelOutcome {
            subscription,
            refund_estimate: refund,
        })
    }

    /// Roll a due subscription into its next period.
    ///
    /// A pending downgrade takes effect first. A subscription flagged to
    /// cancel at period end is canceled instead of renewed. Calling this on a
    /// subscription that is not due returns [`RenewalOutcome::NotDue`] without
    /// writing, whatever `expected_version` is.
    #[instrument(skip(self))]
    pub async fn renew(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<RenewalOutcome> {
        observe(
            "renew",
            self.apply_renewal(subscription_id, expected_version).await,
        )
    }

    async fn apply_renewal(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<RenewalOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let locked = Self::lock_subscription(tx.as_mut(), subscription_id).await?;
        if !locked.is_due_for_renewal(now, self.config.renewal_lookahead) {
            tx.rollback().await?;
            return Ok(RenewalOutcome::NotDue(locked));
        }

        let mut cycle = Self::current_plan(tx.as_mut(), &locked).await?.billing_cycle;
        if let Some(pending) = &locked.pending_downgrade {
            cycle = tx
                .get_plan(pending.plan_id)
                .await?
                .map(|plan| plan.billing_cycle)
                .unwrap_or(cycle);
        }

        let (subscription, step) =
            mutate(tx.as_mut(), subscription_id, expected_version, |s| {
                let before = (s.plan_id, s.price);
                if let Some(pending) = s.pending_downgrade.take() {
                    s.plan_id = pending.plan_id;
                    s.price = pending.price;
                }
                s.updated_utc = now;

                if s.cancel_at_period_end {
                    s.status = SubscriptionStatus::Canceled;
                    s.canceled_at.get_or_insert(now);
                    return Ok(RenewalStep::Canceled { before });
                }

                let start = s.current_period_end;
                s.current_period_end = cycle.period_end(start)?;
                s.current_period_start = start;
                s.trial_end = None;
                s.status = SubscriptionStatus::Active;
                Ok(RenewalStep::Renewed { before })
            })
            .await?;

        let (action, before) = match step {
            RenewalStep::Canceled { before } => (HistoryAction::Canceled, before),
            RenewalStep::Renewed { before } => (HistoryAction::Renewed, before),
        };
        tx.insert_history(&SubscriptionHistory::record(
            subscription_id,
            action,
            Some(before),
            (subscription.plan_id, subscription.price),
            Decimal::ZERO,
            now,
        ))
        .await?;

        if action == HistoryAction::Canceled {
            tx.commit().await?;
            info!(subscription_id = %subscription_id, "Subscription canceled at period end");
            return Ok(RenewalOutcome::Canceled(subscription));
        }

        let invoice = self
            .invoices
            .create_subscription_invoice(tx.as_mut(), &subscription, subscription.current_period())
            .await?;
        tx.commit().await?;
        record_invoice(invoice.kind.as_str(), &invoice.currency, invoice.total);

        info!(
            subscription_id = %subscription_id,
            period_start = %subscription.current_period_start,
            period_end = %subscription.current_period_end,
            invoice_number = %invoice.invoice_number,
            "Subscription renewed"
        );
        Ok(RenewalOutcome::Renewed {
            subscription,
            invoice,
        })
    }

    /// Turn an ended trial into a paid subscription, billing the rest of the
    /// current period.
    #[instrument(skip(self))]
    pub async fn convert_trial(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<TrialConversionOutcome> {
        observe(
            "convert_trial",
            self.apply_trial_conversion(subscription_id, expected_version)
                .await,
        )
    }

    async fn apply_trial_conversion(
        &self,
        subscription_id: Uuid,
        expected_version: i64,
    ) -> BillingResult<TrialConversionOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let locked = Self::lock_subscription(tx.as_mut(), subscription_id).await?;
        let trial_end = match locked.trial_end {
            Some(trial_end) if locked.is_trial_ended(now) => trial_end,
            _ => {
                tx.rollback().await?;
                return Ok(TrialConversionOutcome::NotEnded(locked));
            }
        };
        let cycle = Self::current_plan(tx.as_mut(), &locked).await?.billing_cycle;

        let (subscription, amount) =
            mutate(tx.as_mut(), subscription_id, expected_version, |s| {
                let amount =
                    trial_conversion_proration(s.price, cycle, trial_end, s.current_period_end);
                // The paid period starts where the trial ended.
                s.current_period_start = trial_end;
                s.status = SubscriptionStatus::Active;
                s.updated_utc = now;
                Ok(amount)
            })
            .await?;

        tx.insert_history(&SubscriptionHistory::record(
            subscription_id,
            HistoryAction::TrialConverted,
            Some((locked.plan_id, locked.price)),
            (subscription.plan_id, subscription.price),
            amount,
            now,
        ))
        .await?;

        let invoice = if amount > Decimal::ZERO {
            let window = BillingPeriod::new(trial_end, subscription.current_period_end)
                .unwrap_or_else(|_| subscription.current_period());
            Some(
                self.invoices
                    .create_proration_invoice(tx.as_mut(), &subscription, amount, window)
                    .await?,
            )
        } else {
            None
        };

        tx.commit().await?;
        if let Some(invoice) = &invoice {
            record_invoice(invoice.kind.as_str(), &invoice.currency, invoice.total);
        }

        info!(subscription_id = %subscription_id, charged = %amount, "Trial converted");
        Ok(TrialConversionOutcome::Converted {
            subscription,
            invoice,
        })
    }

    /// Record the outcome of a payment attempt on an invoice.
    ///
    /// A decline moves the subscription to `past_due` and schedules another
    /// attempt; the last allowed decline writes the invoice off and cancels
    /// the subscription. A success restores a `past_due` subscription.
    #[instrument(skip(self, outcome))]
    pub async fn settle_payment(
        &self,
        invoice_id: Uuid,
        outcome: PaymentOutcome,
    ) -> BillingResult<SettlementOutcome> {
        observe(
            "settle_payment",
            self.apply_settlement(invoice_id, outcome).await,
        )
    }

    async fn apply_settlement(
        &self,
        invoice_id: Uuid,
        outcome: PaymentOutcome,
    ) -> BillingResult<SettlementOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut invoice = tx
            .get_invoice_for_update(invoice_id)
            .await?
            .ok_or_else(|| BillingError::not_found(format!("Invoice {} not found", invoice_id)))?;
        if !invoice.status.is_unsettled() {
            tx.rollback().await?;
            return Ok(SettlementOutcome::AlreadySettled(invoice));
        }
        let locked = Self::lock_subscription(tx.as_mut(), invoice.subscription_id).await?;
        invoice.updated_utc = now;

        let settlement = match outcome {
            PaymentOutcome::Succeeded => {
                invoice.status = InvoiceStatus::Paid;
                invoice.amount_paid = invoice.total;
                invoice.amount_due = Decimal::ZERO;
                invoice.next_payment_attempt_at = None;
                tx.update_invoice(&invoice).await?;

                if locked.status == SubscriptionStatus::PastDue {
                    mutate(tx.as_mut(), locked.subscription_id, locked.version, |s| {
                        s.status = SubscriptionStatus::Active;
                        s.updated_utc = now;
                        Ok(())
                    })
                    .await?;
                }
                info!(invoice_id = %invoice_id, amount = %invoice.amount_paid, "Invoice paid");
                SettlementOutcome::Paid(invoice)
            }
            PaymentOutcome::Declined { reason } => {
                invoice.payment_attempts += 1;

                if invoice.payment_attempts >= self.config.payment_max_attempts {
                    invoice.status = InvoiceStatus::Uncollectible;
                    invoice.next_payment_attempt_at = None;
                    tx.update_invoice(&invoice).await?;

                    if !locked.is_canceled() {
                        let (subscription, ()) =
                            mutate(tx.as_mut(), locked.subscription_id, locked.version, |s| {
                                s.status = SubscriptionStatus::Canceled;
                                s.canceled_at = Some(now);
                                s.pending_downgrade = None;
                                s.updated_utc = now;
                                Ok(())
                            })
                            .await?;
                        tx.insert_history(&SubscriptionHistory::record(
                            subscription.subscription_id,
                            HistoryAction::Canceled,
                            Some((locked.plan_id, locked.price)),
                            (subscription.plan_id, subscription.price),
                            Decimal::ZERO,
                            now,
                        ))
                        .await?;
                    }
                    warn!(
                        invoice_id = %invoice_id,
                        attempts = invoice.payment_attempts,
                        reason = %reason,
                        "Payment attempts exhausted, invoice uncollectible"
                    );
                    SettlementOutcome::Uncollectible(invoice)
                } else {
                    invoice.next_payment_attempt_at = Some(now + self.config.payment_retry_interval);
                    tx.update_invoice(&invoice).await?;

                    if matches!(
                        locked.status,
                        SubscriptionStatus::Active | SubscriptionStatus::Trial
                    ) {
                        mutate(tx.as_mut(), locked.subscription_id, locked.version, |s| {
                            s.status = SubscriptionStatus::PastDue;
                            s.updated_utc = now;
                            Ok(())
                        })
                        .await?;
                    }
                    warn!(
                        invoice_id = %invoice_id,
                        attempts = invoice.payment_attempts,
                        reason = %reason,
                        "Payment declined, retry scheduled"
                    );
                    SettlementOutcome::RetryScheduled(invoice)
                }
            }
        };

        tx.commit().await?;
        Ok(settlement)
    }

    /// Estimate a plan change without writing anything.
    #[instrument(skip(self))]
    pub async fn preview_plan_change(
        &self,
        subscription_id: Uuid,
        new_plan_id: Uuid,
    ) -> BillingResult<PlanChangePreview> {
        let now = self.clock.now();
        let subscription = self.get_subscription(subscription_id).await?;
        let target = self
            .store
            .get_plan(new_plan_id)
            .await?
            .ok_or_else(|| plan_not_found(new_plan_id))?;
        let current = self.store.get_plan(subscription.plan_id).await?.ok_or_else(|| {
            BillingError::not_found(format!("Plan {} not found", subscription.plan_id))
        })?;
        check_plan_change(&subscription, &current, &target)?;

        let cycle: BillingCycle = current.billing_cycle;
        let period = subscription.current_period();
        if target.price < subscription.price {
            return Ok(PlanChangePreview {
                kind: PlanChangeKind::Downgrade,
                amount: downgrade_credit(subscription.price, target.price, cycle, &period, now),
            });
        }

        let amount = if subscription.status == SubscriptionStatus::Trial {
            Decimal::ZERO
        } else {
            grace_period_proration(
                subscription.price,
                target.price,
                cycle,
                &period,
                now,
                self.config.grace_period,
            )
        };
        Ok(PlanChangePreview {
            kind: PlanChangeKind::Upgrade,
            amount,
        })
    }
}
