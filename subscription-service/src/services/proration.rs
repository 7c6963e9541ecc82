//! Proration engine.
//!
//! Pure functions computing partial-period charges and credits. Every amount
//! is derived from a daily rate of `price / cycle.proration_days()` (30, 90 or
//! 365 days), so results are approximations and not calendar-accurate. See
//! [`BillingCycle::proration_days`].
//!
//! Functions with charge semantics never return a negative amount. Functions
//! documented as returning a credit may return a signed value, negative
//! meaning money owed back to the customer.

use crate::models::{BillingCycle, BillingPeriod};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

/// Plan changes this close to the period start are free.
pub const DEFAULT_GRACE_PERIOD_HOURS: i64 = 24;

/// Round to cents, half-up.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Unrounded price of one day on `cycle`.
pub fn daily_rate(price: Decimal, cycle: BillingCycle) -> Decimal {
    price / cycle.proration_days()
}

/// Whole days left in `period` at `at`. Dates before the period start count
/// from the start; dates after the end leave zero days.
pub fn remaining_days(period: &BillingPeriod, at: DateTime<Utc>) -> i64 {
    let from = at.max(period.start);
    (period.end - from).num_days().max(0)
}

/// Whole days of `period` already consumed at `at`.
pub fn elapsed_days(period: &BillingPeriod, at: DateTime<Utc>) -> i64 {
    let to = at.min(period.end);
    (to - period.start).num_days().max(0)
}

/// Cost of the new plan for the remaining days minus the unused credit of the
/// old one, each priced on its own cycle.
fn net_change(
    old_price: Decimal,
    old_cycle: BillingCycle,
    new_price: Decimal,
    new_cycle: BillingCycle,
    period: &BillingPeriod,
    change_date: DateTime<Utc>,
) -> Decimal {
    let days = Decimal::from(remaining_days(period, change_date));
    let unused_credit = daily_rate(old_price, old_cycle) * days;
    let new_cost = daily_rate(new_price, new_cycle) * days;
    round_money(new_cost - unused_credit)
}

/// Immediate charge for moving to a pricier plan mid-cycle. Never negative.
pub fn upgrade_proration(
    old_price: Decimal,
    new_price: Decimal,
    cycle: BillingCycle,
    period: &BillingPeriod,
    change_date: DateTime<Utc>,
) -> Decimal {
    net_change(old_price, cycle, new_price, cycle, period, change_date).max(Decimal::ZERO)
}

/// Signed estimate of a plan change; negative when the new plan is cheaper.
///
/// Used for reporting only. Downgrades are applied at renewal and this
/// credit is never issued automatically.
pub fn downgrade_credit(
    old_price: Decimal,
    new_price: Decimal,
    cycle: BillingCycle,
    period: &BillingPeriod,
    change_date: DateTime<Utc>,
) -> Decimal {
    net_change(old_price, cycle, new_price, cycle, period, change_date)
}

/// Upgrade charge when the plans bill on different cycles. Never negative.
///
/// Plan changes across cycles are currently rejected, so this only backs
/// previews.
pub fn cross_cycle_proration(
    old_price: Decimal,
    old_cycle: BillingCycle,
    new_price: Decimal,
    new_cycle: BillingCycle,
    period: &BillingPeriod,
    change_date: DateTime<Utc>,
) -> Decimal {
    net_change(old_price, old_cycle, new_price, new_cycle, period, change_date)
        .max(Decimal::ZERO)
}

/// Value of the days already used at `at`, capped at the price.
pub fn consumed_amount(
    price: Decimal,
    cycle: BillingCycle,
    period: &BillingPeriod,
    at: DateTime<Utc>,
) -> Decimal {
    let days = Decimal::from(elapsed_days(period, at));
    round_money(daily_rate(price, cycle) * days).min(price)
}

/// Credit for the unused part of the period when canceling at `cancel_date`.
///
/// Surfaced to the caller only; no refund is issued. The credit plus
/// [`consumed_amount`] for the same date never exceeds `price`.
pub fn cancellation_refund(
    price: Decimal,
    cycle: BillingCycle,
    period: &BillingPeriod,
    cancel_date: DateTime<Utc>,
) -> Decimal {
    let days = Decimal::from(remaining_days(period, cancel_date));
    let unused = round_money(daily_rate(price, cycle) * days);
    let ceiling = price - consumed_amount(price, cycle, period, cancel_date);
    unused.min(ceiling).max(Decimal::ZERO)
}

/// Charge when a trial converts to paid. A trial that ends on or after the
/// period end buys the full price; otherwise only the days between trial end
/// and period end are billed, capped at the full price.
pub fn trial_conversion_proration(
    price: Decimal,
    cycle: BillingCycle,
    trial_end: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Decimal {
    if period_end <= trial_end {
        return round_money(price);
    }
    let days = Decimal::from((period_end - trial_end).num_days());
    round_money(daily_rate(price, cycle) * days)
        .min(round_money(price))
        .max(Decimal::ZERO)
}

/// True when `change_date` falls within `grace` of the period start.
pub fn is_within_grace_period(
    period: &BillingPeriod,
    change_date: DateTime<Utc>,
    grace: Duration,
) -> bool {
    change_date >= period.start && change_date - period.start < grace
}

/// [`upgrade_proration`], except that changes made within `grace` of the
/// period start cost nothing. Lets customers correct a wrong plan pick.
pub fn grace_period_proration(
    old_price: Decimal,
    new_price: Decimal,
    cycle: BillingCycle,
    period: &BillingPeriod,
    change_date: DateTime<Utc>,
    grace: Duration,
) -> Decimal {
    if is_within_grace_period(period, change_date, grace) {
        return Decimal::ZERO;
    }
    upgrade_proration(old_price, new_price, cycle, period, change_date)
}
