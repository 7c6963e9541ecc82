//! Storage seam for the engine.
//!
//! Every lifecycle operation runs inside one [`BillingTx`]. Dropping a
//! transaction without calling [`BillingTx::commit`] discards all of its
//! writes, so an early `?` return can never leave a partial mutation behind.

use crate::error::BillingResult;
use crate::models::{
    Coupon, CreatePlan, DueSubscriptionsFilter, Invoice, InvoiceItem, Plan, Subscription,
    SubscriptionHistory,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Reads and writes performed inside one atomic transaction.
#[async_trait]
pub trait BillingTx: Send {
    async fn get_plan(&mut self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    /// Read a subscription and hold it for the rest of the transaction.
    async fn get_subscription_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    /// The user's subscription that is not canceled, if any.
    async fn find_live_subscription_for_user(
        &mut self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    /// Fails with `DuplicateSubscription` if the user already holds a live one.
    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()>;

    /// Write `subscription` only if the stored version equals
    /// `expected_version`. Returns the number of rows written (0 or 1).
    async fn update_subscription_if_version(
        &mut self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<u64>;

    async fn insert_history(&mut self, entry: &SubscriptionHistory) -> BillingResult<()>;

    /// Fails with `InvoiceNumberCollision` if the number is taken.
    async fn insert_invoice(&mut self, invoice: &Invoice) -> BillingResult<()>;

    async fn insert_invoice_item(&mut self, item: &InvoiceItem) -> BillingResult<()>;

    async fn get_invoice_for_update(&mut self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn update_invoice(&mut self, invoice: &Invoice) -> BillingResult<()>;

    async fn get_coupon_for_update(&mut self, code: &str) -> BillingResult<Option<Coupon>>;

    async fn decrement_coupon_redemptions(&mut self, code: &str) -> BillingResult<()>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;

    async fn rollback(self: Box<Self>) -> BillingResult<()>;
}

/// Transaction factory plus reads of committed state.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTx>>;

    async fn create_plan(&self, input: &CreatePlan) -> BillingResult<Plan>;

    async fn deactivate_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Live subscriptions whose period ends at or before the filter bound,
    /// oldest first.
    async fn find_subscriptions_due(
        &self,
        filter: &DueSubscriptionsFilter,
    ) -> BillingResult<Vec<Subscription>>;

    /// Trial subscriptions whose trial has ended at `now`.
    async fn find_trials_ending(&self, now: DateTime<Utc>) -> BillingResult<Vec<Subscription>>;

    /// Open invoices with an amount due whose next payment attempt is due.
    async fn find_invoices_due_for_collection(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Invoice>>;

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn list_invoices_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Invoice>>;

    async fn list_invoice_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceItem>>;

    async fn list_history(&self, subscription_id: Uuid)
        -> BillingResult<Vec<SubscriptionHistory>>;

    /// Create or top up a coupon's redemption counter.
    async fn upsert_coupon(&self, coupon: &Coupon) -> BillingResult<()>;

    async fn get_coupon(&self, code: &str) -> BillingResult<Option<Coupon>>;
}
