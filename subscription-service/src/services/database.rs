//! Database service for subscription-service.

use crate::error::{BillingError, BillingResult};
use crate::models::{
    Coupon, CreatePlan, DueSubscriptionsFilter, Invoice, InvoiceItem, PendingDowngrade, Plan,
    Subscription, SubscriptionHistory, SubscriptionStatus, TaxLocation,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{BillingStore, BillingTx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, plan_id, status, current_period_start, current_period_end, trial_end, price, currency, cancel_at_period_end, canceled_at, version, pending_plan_id, pending_price, pending_effective_at, billing_country, billing_state, created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, invoice_number, user_id, subscription_id, kind, status, subtotal, tax_amount, discount_amount, total, amount_paid, amount_due, currency, coupon_code, payment_attempts, next_payment_attempt_at, invoice_date, due_date, created_utc, updated_utc";

const PLAN_COLUMNS: &str =
    "plan_id, name, price, currency, billing_cycle, trial_days, is_active, created_utc";

fn db_error(action: &str, e: sqlx::Error) -> BillingError {
    BillingError::Database(anyhow::anyhow!("Failed to {}: {}", action, e))
}

/// Flat row shape of `subscriptions`; the pending downgrade and billing
/// location are nullable column groups.
#[derive(Debug, FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    status: SubscriptionStatus,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    trial_end: Option<DateTime<Utc>>,
    price: Decimal,
    currency: String,
    cancel_at_period_end: bool,
    canceled_at: Option<DateTime<Utc>>,
    version: i64,
    pending_plan_id: Option<Uuid>,
    pending_price: Option<Decimal>,
    pending_effective_at: Option<DateTime<Utc>>,
    billing_country: Option<String>,
    billing_state: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        let pending_downgrade = match (row.pending_plan_id, row.pending_price, row.pending_effective_at) {
            (Some(plan_id), Some(price), Some(effective_at)) => Some(PendingDowngrade {
                plan_id,
                price,
                effective_at,
            }),
            _ => None,
        };
        let billing_location = row
            .billing_country
            .map(|country| TaxLocation::new(country, row.billing_state));

        Subscription {
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            status: row.status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_end: row.trial_end,
            price: row.price,
            currency: row.currency,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            version: row.version,
            pending_downgrade,
            billing_location,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

/// Open PostgreSQL transaction. Dropping it rolls back.
pub struct PgBillingTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingTx for PgBillingTx {
    #[instrument(skip(self))]
    async fn get_plan(&mut self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let timer = DB_QUERY_DURATION.with_label_values(&["get_plan"]).start_timer();
        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE plan_id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("get plan", e))?;
        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn get_subscription_for_update(
        &mut self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription_for_update"])
            .start_timer();
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("lock subscription", e))?;
        timer.observe_duration();
        Ok(row.map(Subscription::from))
    }

    #[instrument(skip(self))]
    async fn find_live_subscription_for_user(
        &mut self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_live_subscription_for_user"])
            .start_timer();
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND status <> 'canceled' LIMIT 1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("find subscription for user", e))?;
        timer.observe_duration();
        Ok(row.map(Subscription::from))
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id, user_id = %subscription.user_id))]
    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_subscription"])
            .start_timer();
        let pending = subscription.pending_downgrade.as_ref();
        let location = subscription.billing_location.as_ref();

        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, plan_id, status, current_period_start, current_period_end, trial_end, price, currency, cancel_at_period_end, canceled_at, version, pending_plan_id, pending_price, pending_effective_at, billing_country, billing_state, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.user_id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.trial_end)
        .bind(subscription.price)
        .bind(&subscription.currency)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.version)
        .bind(pending.map(|p| p.plan_id))
        .bind(pending.map(|p| p.price))
        .bind(pending.map(|p| p.effective_at))
        .bind(location.map(|l| l.country_code.clone()))
        .bind(location.and_then(|l| l.state_code.clone()))
        .bind(subscription.created_utc)
        .bind(subscription.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                BillingError::DuplicateSubscription(subscription.user_id)
            }
            _ => db_error("insert subscription", e),
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    async fn update_subscription_if_version(
        &mut self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> BillingResult<u64> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription_if_version"])
            .start_timer();
        let pending = subscription.pending_downgrade.as_ref();
        let location = subscription.billing_location.as_ref();

        // Version predicate and write are one statement.
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_id = $3, status = $4, current_period_start = $5, current_period_end = $6,
                trial_end = $7, price = $8, currency = $9, cancel_at_period_end = $10,
                canceled_at = $11, version = $12, pending_plan_id = $13, pending_price = $14,
                pending_effective_at = $15, billing_country = $16, billing_state = $17,
                updated_utc = $18
            WHERE subscription_id = $1 AND version = $2
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(expected_version)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.trial_end)
        .bind(subscription.price)
        .bind(&subscription.currency)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.version)
        .bind(pending.map(|p| p.plan_id))
        .bind(pending.map(|p| p.price))
        .bind(pending.map(|p| p.effective_at))
        .bind(location.map(|l| l.country_code.clone()))
        .bind(location.and_then(|l| l.state_code.clone()))
        .bind(subscription.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("update subscription", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, entry), fields(subscription_id = %entry.subscription_id, action = entry.action.as_str()))]
    async fn insert_history(&mut self, entry: &SubscriptionHistory) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_history"])
            .start_timer();
        sqlx::query(
            r#"
            INSERT INTO subscription_history (history_id, subscription_id, action, previous_plan_id, new_plan_id, previous_price, new_price, proration_amount, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.history_id)
        .bind(entry.subscription_id)
        .bind(entry.action.as_str())
        .bind(entry.previous_plan_id)
        .bind(entry.new_plan_id)
        .bind(entry.previous_price)
        .bind(entry.new_price)
        .bind(entry.proration_amount)
        .bind(entry.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("insert history", e))?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, invoice), fields(invoice_number = %invoice.invoice_number))]
    async fn insert_invoice(&mut self, invoice: &Invoice) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();
        sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, invoice_number, user_id, subscription_id, kind, status, subtotal, tax_amount, discount_amount, total, amount_paid, amount_due, currency, coupon_code, payment_attempts, next_payment_attempt_at, invoice_date, due_date, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.user_id)
        .bind(invoice.subscription_id)
        .bind(invoice.kind.as_str())
        .bind(invoice.status.as_str())
        .bind(invoice.subtotal)
        .bind(invoice.tax_amount)
        .bind(invoice.discount_amount)
        .bind(invoice.total)
        .bind(invoice.amount_paid)
        .bind(invoice.amount_due)
        .bind(&invoice.currency)
        .bind(&invoice.coupon_code)
        .bind(invoice.payment_attempts)
        .bind(invoice.next_payment_attempt_at)
        .bind(invoice.invoice_date)
        .bind(invoice.due_date)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                BillingError::InvoiceNumberCollision(invoice.invoice_number.clone())
            }
            _ => db_error("insert invoice", e),
        })?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, item), fields(invoice_id = %item.invoice_id))]
    async fn insert_invoice_item(&mut self, item: &InvoiceItem) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice_item"])
            .start_timer();
        sqlx::query(
            r#"
            INSERT INTO invoice_items (item_id, invoice_id, description, quantity, unit_price, amount, is_proration, period_start, period_end, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(item.item_id)
        .bind(item.invoice_id)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.amount)
        .bind(item.is_proration)
        .bind(item.period_start)
        .bind(item.period_end)
        .bind(item.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("insert invoice item", e))?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_invoice_for_update(&mut self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_for_update"])
            .start_timer();
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1 FOR UPDATE",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("lock invoice", e))?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, invoice), fields(invoice_id = %invoice.invoice_id))]
    async fn update_invoice(&mut self, invoice: &Invoice) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, tax_amount = $3, discount_amount = $4, total = $5, amount_paid = $6,
                amount_due = $7, coupon_code = $8, payment_attempts = $9,
                next_payment_attempt_at = $10, updated_utc = $11
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.status.as_str())
        .bind(invoice.tax_amount)
        .bind(invoice.discount_amount)
        .bind(invoice.total)
        .bind(invoice.amount_paid)
        .bind(invoice.amount_due)
        .bind(&invoice.coupon_code)
        .bind(invoice.payment_attempts)
        .bind(invoice.next_payment_attempt_at)
        .bind(invoice.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("update invoice", e))?;
        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(BillingError::not_found(format!(
                "Invoice {} not found",
                invoice.invoice_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_coupon_for_update(&mut self, code: &str) -> BillingResult<Option<Coupon>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_coupon_for_update"])
            .start_timer();
        let coupon = sqlx::query_as::<_, Coupon>(
            "SELECT code, redemptions_remaining, is_active FROM coupons WHERE code = $1 FOR UPDATE",
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("lock coupon", e))?;
        timer.observe_duration();
        Ok(coupon)
    }

    #[instrument(skip(self))]
    async fn decrement_coupon_redemptions(&mut self, code: &str) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["decrement_coupon_redemptions"])
            .start_timer();
        let result = sqlx::query(
            r#"
            UPDATE coupons SET redemptions_remaining = redemptions_remaining - 1
            WHERE code = $1 AND redemptions_remaining > 0
            "#,
        )
        .bind(code)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("decrement coupon", e))?;
        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(BillingError::validation(format!(
                "Coupon {} has no redemptions left",
                code
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error("commit transaction", e))
    }

    async fn rollback(self: Box<Self>) -> BillingResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| db_error("roll back transaction", e))
    }
}

#[async_trait]
impl BillingStore for Database {
    async fn begin(&self) -> BillingResult<Box<dyn BillingTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;
        Ok(Box::new(PgBillingTx { tx }))
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    async fn create_plan(&self, input: &CreatePlan) -> BillingResult<Plan> {
        input.validate()?;
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, Plan>(&format!(
            r#"
            INSERT INTO plans (plan_id, name, price, currency, billing_cycle, trial_days)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            PLAN_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(input.price)
        .bind(&input.currency)
        .bind(input.billing_cycle.as_str())
        .bind(input.trial_days)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("create plan", e))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan created");
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn deactivate_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["deactivate_plan"])
            .start_timer();
        let plan = sqlx::query_as::<_, Plan>(&format!(
            "UPDATE plans SET is_active = FALSE WHERE plan_id = $1 RETURNING {}",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("deactivate plan", e))?;
        timer.observe_duration();

        if plan.is_some() {
            info!(plan_id = %plan_id, "Plan deactivated");
        }
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let timer = DB_QUERY_DURATION.with_label_values(&["get_plan"]).start_timer();
        let plan = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {} FROM plans WHERE plan_id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get plan", e))?;
        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self))]
    async fn get_subscription(&self, subscription_id: Uuid) -> BillingResult<Option<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get subscription", e))?;
        timer.observe_duration();
        Ok(row.map(Subscription::from))
    }

    #[instrument(skip(self, filter), fields(period_end_before = %filter.period_end_before))]
    async fn find_subscriptions_due(
        &self,
        filter: &DueSubscriptionsFilter,
    ) -> BillingResult<Vec<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscriptions_due"])
            .start_timer();
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status <> 'canceled' AND current_period_end <= $1
            ORDER BY current_period_end
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(filter.period_end_before)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find due subscriptions", e))?;
        timer.observe_duration();
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    #[instrument(skip(self))]
    async fn find_trials_ending(&self, now: DateTime<Utc>) -> BillingResult<Vec<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_trials_ending"])
            .start_timer();
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status = 'trial' AND trial_end <= $1
            ORDER BY trial_end
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find ending trials", e))?;
        timer.observe_duration();
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    #[instrument(skip(self))]
    async fn find_invoices_due_for_collection(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoices_due_for_collection"])
            .start_timer();
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {} FROM invoices
            WHERE status = 'open' AND amount_due > 0 AND next_payment_attempt_at <= $1
            ORDER BY next_payment_attempt_at
            "#,
            INVOICE_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("find invoices due for collection", e))?;
        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get invoice", e))?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn list_invoices_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<Invoice>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices_for_subscription"])
            .start_timer();
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE subscription_id = $1 ORDER BY created_utc",
            INVOICE_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list invoices", e))?;
        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn list_invoice_items(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceItem>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoice_items"])
            .start_timer();
        let items = sqlx::query_as::<_, InvoiceItem>(
            r#"
            SELECT item_id, invoice_id, description, quantity, unit_price, amount, is_proration, period_start, period_end, created_utc
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list invoice items", e))?;
        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn list_history(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionHistory>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_history"])
            .start_timer();
        let history = sqlx::query_as::<_, SubscriptionHistory>(
            r#"
            SELECT history_id, subscription_id, action, previous_plan_id, new_plan_id, previous_price, new_price, proration_amount, created_utc
            FROM subscription_history
            WHERE subscription_id = $1
            ORDER BY created_utc, history_id
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list history", e))?;
        timer.observe_duration();
        Ok(history)
    }

    #[instrument(skip(self, coupon), fields(code = %coupon.code))]
    async fn upsert_coupon(&self, coupon: &Coupon) -> BillingResult<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_coupon"])
            .start_timer();
        sqlx::query(
            r#"
            INSERT INTO coupons (code, redemptions_remaining, is_active)
            VALUES ($1, $2, $3)
            ON CONFLICT (code) DO UPDATE
            SET redemptions_remaining = EXCLUDED.redemptions_remaining, is_active = EXCLUDED.is_active
            "#,
        )
        .bind(&coupon.code)
        .bind(coupon.redemptions_remaining)
        .bind(coupon.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("upsert coupon", e))?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_coupon(&self, code: &str) -> BillingResult<Option<Coupon>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_coupon"])
            .start_timer();
        let coupon = sqlx::query_as::<_, Coupon>(
            "SELECT code, redemptions_remaining, is_active FROM coupons WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get coupon", e))?;
        timer.observe_duration();
        Ok(coupon)
    }
}
