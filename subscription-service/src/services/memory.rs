//! In-process store.
//!
//! A transaction takes the store-wide lock and works on a copy of the state;
//! commit swaps the copy in. Transactions are therefore serialized, and a
//! writer holding a stale version observes the committed one and conflicts.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Coupon, CreatePlan, DueSubscriptionsFilter, Invoice, InvoiceItem, InvoiceStatus, Plan,
    Subscription, SubscriptionHistory, SubscriptionStatus,
};
use crate::services::store::{BillingStore, BillingTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    subscriptions: HashMap<Uuid, Subscription>,
    history: Vec<SubscriptionHistory>,
    invoices: HashMap<Uuid, Invoice>,
    invoice_items: Vec<InvoiceItem>,
    coupons: HashMap<String, Coupon>,
}

impl State {
    fn live_subscription_for_user(&self, user_id: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.user_id == user_id && !s.is_canceled())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a plan as-is, keeping its id. Used to seed fixtures.
    pub async fn insert_plan(&self, plan: Plan) {
        self.state.lock().await.plans.insert(plan.plan_id, plan);
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl BillingTx for MemoryTx {
    async fn get_plan(&mut self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.working.plans.get(&plan_id).cloned())
    }

    async fn get_subscription_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.working.subscriptions.get(&subscription_id).cloned())
    }

    async fn find_live_subscription_for_user(
        &mut self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.working.live_subscription_for_user(user_id).cloned())
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        if self
            .working
            .live_subscription_for_user(subscription.user_id)
            .is_some()
        {
            return Err(BillingError::DuplicateSubscription(subscription.user_id));
        }
        self.working
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(())
    }

    async fn update_subscription_if_version(
        &mut self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<u64> {
        match self.working.subscriptions.get_mut(&subscription.subscription_id) {
            Some(stored) if stored.version == expected_version => {
                *stored = subscription.clone();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_history(&mut self, entry: &SubscriptionHistory) -> BillingResult<()> {
        self.working.history.push(entry.clone());
        Ok(())
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> BillingResult<()> {
        if self
            .working
            .invoices
            .values()
            .any(|i| i.invoice_number == invoice.invoice_number)
        {
            return Err(BillingError::InvoiceNumberCollision(
                invoice.invoice_number.clone(),
            ));
        }
        self.working
            .invoices
            .insert(invoice.invoice_id, invoice.clone());
        Ok(())
    }

    async fn insert_invoice_item(&mut self, item: &InvoiceItem) -> BillingResult<()> {
        self.working.invoice_items.push(item.clone());
        Ok(())
    }

    async fn get_invoice_for_update(&mut self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.working.invoices.get(&invoice_id).cloned())
    }

    async fn update_invoice(&mut self, invoice: &Invoice) -> BillingResult<()> {
        match self.working.invoices.get_mut(&invoice.invoice_id) {
            Some(stored) => {
                *stored = invoice.clone();
                Ok(())
            }
            None => Err(BillingError::not_found(format!(
                "Invoice {} not found",
                invoice.invoice_id
            ))),
        }
    }

    async fn get_coupon_for_update(&mut self, code: &str) -> BillingResult<Option<Coupon>> {
        Ok(self.working.coupons.get(code).cloned())
    }

    async fn decrement_coupon_redemptions(&mut self, code: &str) -> BillingResult<()> {
        match self.working.coupons.get_mut(code) {
            Some(coupon) if coupon.redemptions_remaining > 0 => {
                coupon.redemptions_remaining -= 1;
                Ok(())
            }
            Some(_) => Err(BillingError::validation(format!(
                "Coupon {} has no redemptions left",
                code
            ))),
            None => Err(BillingError::not_found(format!("Coupon {} not found", code))),
        }
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BillingResult<()> {
        Ok(())
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn create_plan(&self, input: &CreatePlan) -> BillingResult<Plan> {
        input.validate()?;
        let plan = Plan {
            plan_id: Uuid::new_v4(),
            name: input.name.clone(),
            price: input.price,
            currency: input.currency.clone(),
            billing_cycle: input.billing_cycle,
            trial_days: input.trial_days,
            is_active: true,
            created_utc: Utc::now(),
        };
        self.state
            .lock()
            .await
            .plans
            .insert(plan.plan_id, plan.clone());
        Ok(plan)
    }

    async fn deactivate_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let mut state = self.state.lock().await;
        Ok(state.plans.get_mut(&plan_id).map(|plan| {
            plan.is_active = false;
            plan.clone()
        }))
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.state.lock().await.plans.get(&plan_id).cloned())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned())
    }

    async fn find_subscriptions_due(
        &self,
        filter: &DueSubscriptionsFilter,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut due: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| !s.is_canceled() && s.current_period_end <= filter.period_end_before)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.current_period_end);
        due.truncate(filter.limit.max(0) as usize);
        Ok(due)
    }

    async fn find_trials_ending(&self, now: DateTime<Utc>) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut ending: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Trial && s.is_trial_ended(now))
            .cloned()
            .collect();
        ending.sort_by_key(|s| s.trial_end);
        Ok(ending)
    }

    async fn find_invoices_due_for_collection(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        let mut due: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| {
                i.status == InvoiceStatus::Open
                    && i.amount_due > Decimal::ZERO
                    && i.next_payment_attempt_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|i| i.next_payment_attempt_at);
        Ok(due)
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.state.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn list_invoices_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Invoice>> {
        let state = self.state.lock().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.subscription_id == subscription_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_utc);
        Ok(invoices)
    }

    async fn list_invoice_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceItem>> {
        let state = self.state.lock().await;
        Ok(state
            .invoice_items
            .iter()
            .filter(|item| item.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn list_history(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionHistory>> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|h| h.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn upsert_coupon(&self, coupon: &Coupon) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .coupons
            .insert(coupon.code.clone(), coupon.clone());
        Ok(())
    }

    async fn get_coupon(&self, code: &str) -> BillingResult<Option<Coupon>> {
        Ok(self.state.lock().await.coupons.get(code).cloned())
    }
}
