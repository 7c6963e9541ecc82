//! Integration tests for upgrades, scheduled downgrades and previews.

mod common;

use chrono::Duration;
use common::{assert_conflict, dec, start_time, TestEngine};
use subscription_service::error::BillingError;
use subscription_service::models::{
    BillingCycle, CreatePlan, HistoryAction, InvoiceKind, SubscriptionStatus,
};
use subscription_service::services::PlanChangeKind;

#[tokio::test]
async fn test_mid_cycle_upgrade_charges_prorated_difference() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&basic).await;
    engine.advance_days(15);

    let outcome = engine
        .manager
        .upgrade(subscription.subscription_id, pro.plan_id, 0)
        .await
        .unwrap();

    assert_eq!(outcome.proration_amount, dec("10.00"));
    assert_eq!(outcome.subscription.plan_id, pro.plan_id);
    assert_eq!(outcome.subscription.price, dec("30.00"));
    assert_eq!(outcome.subscription.version, 1);
    // Period boundaries do not move on an upgrade.
    assert_eq!(
        outcome.subscription.current_period_end,
        subscription.current_period_end
    );

    let invoice = outcome.invoice.expect("upgrade should be invoiced");
    assert_eq!(invoice.kind, InvoiceKind::Proration);
    assert_eq!(invoice.subtotal, dec("10.00"));
    assert_eq!(invoice.total, dec("10.00"));

    let items = engine
        .store
        .list_invoice_items(invoice.invoice_id)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0].is_proration);
    assert_eq!(items[0].period_start, Some(start_time() + Duration::days(15)));
    assert_eq!(items[0].period_end, Some(subscription.current_period_end));

    let history = engine.history_for(subscription.subscription_id).await;
    let upgraded = history
        .iter()
        .find(|h| h.action == HistoryAction::Upgraded)
        .expect("upgrade history row");
    assert_eq!(upgraded.previous_plan_id, Some(basic.plan_id));
    assert_eq!(upgraded.previous_price, Some(dec("10.00")));
    assert_eq!(upgraded.new_price, dec("30.00"));
    assert_eq!(upgraded.proration_amount, dec("10.00"));

    assert_eq!(engine.invoices_for(subscription.subscription_id).await.len(), 2);
}

#[tokio::test]
async fn test_upgrade_within_grace_period_is_free() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&basic).await;
    engine.advance_hours(2);

    let outcome = engine
        .manager
        .upgrade(subscription.subscription_id, pro.plan_id, 0)
        .await
        .unwrap();

    assert_eq!(outcome.proration_amount, dec("0"));
    assert!(outcome.invoice.is_none());
    assert_eq!(outcome.subscription.price, dec("30.00"));
    assert_eq!(engine.invoices_for(subscription.subscription_id).await.len(), 1);
}

#[tokio::test]
async fn test_upgrade_during_trial_charges_nothing() {
    let engine = TestEngine::new();
    let starter = engine.plan("Starter", "9.99", BillingCycle::Monthly, 14).await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&starter).await;
    engine.advance_days(5);

    let outcome = engine
        .manager
        .upgrade(subscription.subscription_id, pro.plan_id, 0)
        .await
        .unwrap();

    assert_eq!(outcome.proration_amount, dec("0"));
    assert!(outcome.invoice.is_none());
    assert_eq!(outcome.subscription.status, SubscriptionStatus::Trial);
    assert_eq!(outcome.subscription.price, dec("30.00"));
}

#[tokio::test]
async fn test_concurrent_upgrades_one_wins_one_conflicts() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let max = engine.monthly("Max", "50.00").await;
    let subscription = engine.subscribe(&basic).await;
    engine.advance_days(15);

    let (first, second) = tokio::join!(
        engine
            .manager
            .upgrade(subscription.subscription_id, pro.plan_id, 0),
        engine
            .manager
            .upgrade(subscription.subscription_id, max.plan_id, 0),
    );

    let results = [first, second];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(BillingError::Conflict { .. })))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);

    let current = engine.subscription(subscription.subscription_id).await;
    assert_eq!(current.version, 1);

    let upgrades = engine
        .history_for(subscription.subscription_id)
        .await
        .into_iter()
        .filter(|h| h.action == HistoryAction::Upgraded)
        .count();
    assert_eq!(upgrades, 1);
}

#[tokio::test]
async fn test_upgrade_with_stale_version_writes_nothing() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&basic).await;
    engine.advance_days(15);

    let result = engine
        .manager
        .upgrade(subscription.subscription_id, pro.plan_id, 7)
        .await;
    assert_conflict(&result);

    let current = engine.subscription(subscription.subscription_id).await;
    assert_eq!(current.plan_id, basic.plan_id);
    assert_eq!(current.version, 0);
    assert_eq!(engine.invoices_for(subscription.subscription_id).await.len(), 1);
    assert_eq!(engine.history_for(subscription.subscription_id).await.len(), 1);
}

#[tokio::test]
async fn test_plan_change_across_billing_cycles_is_rejected() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let annual = engine
        .plan("Annual", "100.00", BillingCycle::Yearly, 0)
        .await;
    let subscription = engine.subscribe(&basic).await;

    let result = engine
        .manager
        .upgrade(subscription.subscription_id, annual.plan_id, 0)
        .await;
    assert!(matches!(
        result,
        Err(BillingError::BillingCycleMismatch { .. })
    ));

    let result = engine
        .manager
        .preview_plan_change(subscription.subscription_id, annual.plan_id)
        .await;
    assert!(matches!(
        result,
        Err(BillingError::BillingCycleMismatch { .. })
    ));
}

#[tokio::test]
async fn test_plan_change_rejects_same_plan_other_currency_and_inactive_target() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let euro = engine
        .store
        .create_plan(&CreatePlan {
            name: "Euro Pro".to_string(),
            price: dec("30.00"),
            currency: "EUR".to_string(),
            billing_cycle: BillingCycle::Monthly,
            trial_days: 0,
        })
        .await
        .unwrap();
    let retired = engine.monthly("Retired", "40.00").await;
    engine.store.deactivate_plan(retired.plan_id).await.unwrap();
    let subscription = engine.subscribe(&basic).await;

    for target in [basic.plan_id, euro.plan_id, retired.plan_id] {
        let result = engine
            .manager
            .upgrade(subscription.subscription_id, target, 0)
            .await;
        assert!(
            matches!(result, Err(BillingError::Validation(_))),
            "unexpected result for plan {}: {:?}",
            target,
            result
        );
    }

    assert_eq!(engine.subscription(subscription.subscription_id).await.version, 0);
}

#[tokio::test]
async fn test_canceled_subscription_cannot_change_plans() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&basic).await;
    engine
        .manager
        .cancel(subscription.subscription_id, true, 0)
        .await
        .unwrap();

    let result = engine
        .manager
        .upgrade(subscription.subscription_id, pro.plan_id, 1)
        .await;
    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn test_downgrade_is_staged_until_period_end() {
    let engine = TestEngine::new();
    let pro = engine.monthly("Pro", "30.00").await;
    let basic = engine.monthly("Basic", "10.00").await;
    let subscription = engine.subscribe(&pro).await;
    engine.advance_days(15);

    let outcome = engine
        .manager
        .downgrade(subscription.subscription_id, basic.plan_id, 0)
        .await
        .unwrap();

    assert!(outcome.invoice.is_none());
    assert_eq!(outcome.proration_amount, dec("-10.00"));
    assert_eq!(outcome.subscription.plan_id, pro.plan_id);
    assert_eq!(outcome.subscription.price, dec("30.00"));
    let pending = outcome
        .subscription
        .pending_downgrade
        .clone()
        .expect("downgrade should be pending");
    assert_eq!(pending.plan_id, basic.plan_id);
    assert_eq!(pending.price, dec("10.00"));
    assert_eq!(pending.effective_at, subscription.current_period_end);

    let history = engine.history_for(subscription.subscription_id).await;
    let downgraded = history
        .iter()
        .find(|h| h.action == HistoryAction::Downgraded)
        .expect("downgrade history row");
    assert_eq!(downgraded.new_plan_id, basic.plan_id);
    assert_eq!(downgraded.proration_amount, dec("-10.00"));

    assert_eq!(engine.invoices_for(subscription.subscription_id).await.len(), 1);
}

#[tokio::test]
async fn test_downgrade_to_pricier_plan_is_rejected() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&basic).await;

    let result = engine
        .manager
        .downgrade(subscription.subscription_id, pro.plan_id, 0)
        .await;
    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn test_upgrade_clears_pending_downgrade() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let max = engine.monthly("Max", "50.00").await;
    let subscription = engine.subscribe(&pro).await;
    engine.advance_days(15);

    engine
        .manager
        .downgrade(subscription.subscription_id, basic.plan_id, 0)
        .await
        .unwrap();
    let outcome = engine
        .manager
        .upgrade(subscription.subscription_id, max.plan_id, 1)
        .await
        .unwrap();

    assert!(outcome.subscription.pending_downgrade.is_none());
    assert_eq!(outcome.subscription.plan_id, max.plan_id);
    assert_eq!(outcome.subscription.version, 2);
    assert_eq!(outcome.proration_amount, dec("10.00"));

    let stored = engine.subscription(subscription.subscription_id).await;
    assert!(stored.pending_downgrade.is_none());
}

#[tokio::test]
async fn test_preview_matches_charge_without_writing() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&pro).await;
    engine.advance_days(15);

    let downgrade = engine
        .manager
        .preview_plan_change(subscription.subscription_id, basic.plan_id)
        .await
        .unwrap();
    assert_eq!(downgrade.kind, PlanChangeKind::Downgrade);
    assert_eq!(downgrade.amount, dec("-10.00"));

    let max = engine.monthly("Max", "60.00").await;
    let upgrade = engine
        .manager
        .preview_plan_change(subscription.subscription_id, max.plan_id)
        .await
        .unwrap();
    assert_eq!(upgrade.kind, PlanChangeKind::Upgrade);
    assert_eq!(upgrade.amount, dec("15.00"));

    let stored = engine.subscription(subscription.subscription_id).await;
    assert_eq!(stored.version, 0);
    assert_eq!(engine.history_for(subscription.subscription_id).await.len(), 1);

    let charged = engine
        .manager
        .upgrade(subscription.subscription_id, max.plan_id, 0)
        .await
        .unwrap();
    assert_eq!(charged.proration_amount, upgrade.amount);
}
