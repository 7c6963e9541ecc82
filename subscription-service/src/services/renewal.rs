//! Renewal & Retry Orchestrator.
//!
//! One pass converts ended trials, renews due subscriptions and collects
//! open invoices. Subscriptions are independent: each is retried on version
//! conflicts with a fixed delay, and a failure on one never aborts the pass.

use crate::error::BillingResult;
use crate::models::{DueSubscriptionsFilter, Invoice, Subscription};
use crate::services::collaborators::{with_deadline, PaymentCollaborator};
use crate::services::lifecycle::{
    RenewalOutcome, SettlementOutcome, SubscriptionManager, TrialConversionOutcome,
};
use crate::services::metrics::record_renewal;
use crate::services::store::BillingStore;
use chrono::Duration as ChronoDuration;
use futures::stream::{self, StreamExt};
use service_core::retry::{retry_with_policy, RetryConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// Time between scheduled passes.
    pub interval: Duration,
    /// Upper bound on subscriptions renewed per pass.
    pub batch_size: i64,
    /// Retries after a version conflict, on top of the first attempt.
    pub max_conflict_retries: u32,
    pub retry_delay: Duration,
    /// Subscriptions processed in parallel.
    pub concurrency: usize,
    pub payment_timeout: Duration,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 500,
            max_conflict_retries: 3,
            retry_delay: Duration::from_millis(250),
            concurrency: 8,
            payment_timeout: Duration::from_secs(5),
        }
    }
}

/// Counts for one orchestrator pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalRunSummary {
    pub processed: usize,
    pub renewed: usize,
    pub canceled: usize,
    pub not_due: usize,
    pub trials_converted: usize,
    pub payments_collected: usize,
    pub payments_declined: usize,
    /// Still conflicting after the retry budget; picked up next pass.
    pub skipped: usize,
    pub failed: usize,
}

pub struct RenewalOrchestrator {
    manager: Arc<SubscriptionManager>,
    store: Arc<dyn BillingStore>,
    payments: Option<Arc<dyn PaymentCollaborator>>,
    config: RenewalConfig,
}

impl RenewalOrchestrator {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        store: Arc<dyn BillingStore>,
        config: RenewalConfig,
    ) -> Self {
        Self {
            manager,
            store,
            payments: None,
            config,
        }
    }

    pub fn with_payments(mut self, payments: Arc<dyn PaymentCollaborator>) -> Self {
        self.payments = Some(payments);
        self
    }

    /// Run `op` against `subscription`, first with the version it was
    /// scanned at and, after a conflict, with a freshly read one.
    async fn with_conflict_retry<T, F, Fut>(
        &self,
        operation: &str,
        subscription: &Subscription,
        op: F,
    ) -> BillingResult<T>
    where
        F: Fn(Uuid, i64) -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let retry = RetryConfig::fixed(self.config.max_conflict_retries, self.config.retry_delay);
        let subscription_id = subscription.subscription_id;
        let mut scanned = Some(subscription.version);
        let op = &op;
        let manager = &self.manager;

        retry_with_policy(&retry, operation, || {
            let scanned = scanned.take();
            async move {
                let version = match scanned {
                    Some(version) => version,
                    None => manager.get_subscription(subscription_id).await?.version,
                };
                op(subscription_id, version).await
            }
        })
        .await
    }

    /// One full pass: trial conversions, renewals, then payment collection.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> BillingResult<RenewalRunSummary> {
        let now = self.manager.now();
        let mut summary = RenewalRunSummary::default();

        self.convert_trials(now, &mut summary).await?;
        self.renew_due(now, &mut summary).await?;
        if let Some(payments) = &self.payments {
            self.collect_payments(payments.as_ref(), now, &mut summary)
                .await?;
        }

        info!(
            processed = summary.processed,
            renewed = summary.renewed,
            canceled = summary.canceled,
            trials_converted = summary.trials_converted,
            payments_collected = summary.payments_collected,
            payments_declined = summary.payments_declined,
            skipped = summary.skipped,
            failed = summary.failed,
            "Renewal pass completed"
        );
        Ok(summary)
    }

    async fn convert_trials(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        summary: &mut RenewalRunSummary,
    ) -> BillingResult<()> {
        let ending = self.store.find_trials_ending(now).await?;
        let manager = &self.manager;

        let results: Vec<(Uuid, BillingResult<TrialConversionOutcome>)> = stream::iter(ending)
            .map(|subscription| async move {
                let result = self
                    .with_conflict_retry("convert_trial", &subscription, move |id, version| {
                        manager.convert_trial(id, version)
                    })
                    .await;
                (subscription.subscription_id, result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (subscription_id, result) in results {
            summary.processed += 1;
            match result {
                Ok(TrialConversionOutcome::Converted { .. }) => summary.trials_converted += 1,
                Ok(TrialConversionOutcome::NotEnded(_)) => {}
                Err(e) => self.tally_failure(summary, subscription_id, "convert_trial", &e),
            }
        }
        Ok(())
    }

    async fn renew_due(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        summary: &mut RenewalRunSummary,
    ) -> BillingResult<()> {
        let lookahead: ChronoDuration = self.manager.config().renewal_lookahead;
        let due = self
            .store
            .find_subscriptions_due(&DueSubscriptionsFilter {
                period_end_before: now + lookahead,
                limit: self.config.batch_size,
            })
            .await?;
        let manager = &self.manager;

        let results: Vec<(Uuid, BillingResult<RenewalOutcome>)> = stream::iter(due)
            .map(|subscription| async move {
                let result = self
                    .with_conflict_retry("renew_subscription", &subscription, move |id, version| {
                        manager.renew(id, version)
                    })
                    .await;
                (subscription.subscription_id, result)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (subscription_id, result) in results {
            summary.processed += 1;
            match result {
                Ok(RenewalOutcome::Renewed { .. }) => {
                    summary.renewed += 1;
                    record_renewal("renewed");
                }
                Ok(RenewalOutcome::Canceled(_)) => {
                    summary.canceled += 1;
                    record_renewal("canceled");
                }
                Ok(RenewalOutcome::NotDue(_)) => {
                    summary.not_due += 1;
                    record_renewal("not_due");
                }
                Err(e) => self.tally_failure(summary, subscription_id, "renew_subscription", &e),
            }
        }
        Ok(())
    }

    async fn collect_payments(
        &self,
        payments: &dyn PaymentCollaborator,
        now: chrono::DateTime<chrono::Utc>,
        summary: &mut RenewalRunSummary,
    ) -> BillingResult<()> {
        let invoices = self.store.find_invoices_due_for_collection(now).await?;

        for invoice in invoices {
            match self.collect_one(payments, &invoice).await {
                Ok(SettlementOutcome::Paid(_)) => summary.payments_collected += 1,
                Ok(SettlementOutcome::RetryScheduled(_))
                | Ok(SettlementOutcome::Uncollectible(_)) => summary.payments_declined += 1,
                Ok(SettlementOutcome::AlreadySettled(_)) => {}
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        invoice_id = %invoice.invoice_id,
                        error = %e,
                        "Payment collection failed, invoice left for next pass"
                    );
                }
            }
        }
        Ok(())
    }

    async fn collect_one(
        &self,
        payments: &dyn PaymentCollaborator,
        invoice: &Invoice,
    ) -> BillingResult<SettlementOutcome> {
        let outcome =
            with_deadline("payment", self.config.payment_timeout, payments.collect(invoice))
                .await?;
        self.manager
            .settle_payment(invoice.invoice_id, outcome)
            .await
    }

    fn tally_failure(
        &self,
        summary: &mut RenewalRunSummary,
        subscription_id: Uuid,
        operation: &str,
        err: &crate::error::BillingError,
    ) {
        if err.is_retryable() {
            summary.skipped += 1;
            record_renewal("skipped");
            warn!(
                subscription_id = %subscription_id,
                operation = operation,
                error = %err,
                "Retries exhausted, subscription skipped until next pass"
            );
        } else {
            summary.failed += 1;
            record_renewal("failed");
            error!(
                subscription_id = %subscription_id,
                operation = operation,
                error = %err,
                "Subscription processing failed"
            );
        }
    }
}

/// Drives [`RenewalOrchestrator::run_once`] on a fixed interval.
pub struct RenewalScheduler {
    orchestrator: Arc<RenewalOrchestrator>,
    interval: Duration,
}

impl RenewalScheduler {
    /// A zero `interval` is raised to one second.
    pub fn new(orchestrator: Arc<RenewalOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval: if interval.is_zero() {
                Duration::from_secs(1)
            } else {
                interval
            },
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run passes until `shutdown` is cancelled. The first pass starts
    /// immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Renewal scheduler started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Renewal scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.orchestrator.run_once().await {
                        error!(error = %e, "Renewal pass failed");
                    }
                }
            }
        }
    }
}
