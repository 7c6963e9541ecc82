//! Domain models for subscription-service.

mod history;
mod invoice;
mod plan;
mod subscription;

pub use history::{HistoryAction, SubscriptionHistory};
pub use invoice::{Coupon, Invoice, InvoiceItem, InvoiceKind, InvoiceStatus, PaymentOutcome};
pub use plan::{BillingCycle, CreatePlan, Plan};
pub use subscription::{
    BillingPeriod, CreateSubscription, DueSubscriptionsFilter, PendingDowngrade, Subscription,
    SubscriptionStatus, TaxLocation,
};
