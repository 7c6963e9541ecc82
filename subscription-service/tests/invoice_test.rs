//! Integration tests for invoice assembly, coupons and collaborator failures.

mod common;

use common::{dec, EngineOptions, ScriptedInvoiceNumbers, StalledTax, TestEngine};
use std::sync::Arc;
use std::time::Duration;
use subscription_service::error::BillingError;
use subscription_service::models::{
    Coupon, CreateSubscription, Invoice, InvoiceStatus, PaymentOutcome, TaxLocation,
};
use uuid::Uuid;

fn germany() -> Option<TaxLocation> {
    Some(TaxLocation::new("DE", None))
}

async fn first_invoice(engine: &TestEngine, subscription_id: Uuid) -> Invoice {
    engine
        .invoices_for(subscription_id)
        .await
        .into_iter()
        .next()
        .expect("subscription should have an invoice")
}

async fn seed_coupon(engine: &TestEngine, code: &str, redemptions: i32, active: bool) {
    engine
        .store
        .upsert_coupon(&Coupon {
            code: code.to_string(),
            redemptions_remaining: redemptions,
            is_active: active,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_invoice_taxed_at_billing_location() {
    let engine = TestEngine::new();
    let pro = engine.monthly("Pro", "30.00").await;

    let subscription = engine.subscribe_at(&pro, germany()).await;
    let invoice = first_invoice(&engine, subscription.subscription_id).await;

    assert_eq!(invoice.subtotal, dec("30.00"));
    assert_eq!(invoice.tax_amount, dec("5.70"));
    assert_eq!(invoice.total, dec("35.70"));
    assert_eq!(invoice.amount_due, dec("35.70"));
}

#[tokio::test]
async fn test_invoice_without_location_uses_fallback_jurisdiction() {
    let engine = TestEngine::with_options(EngineOptions {
        fallback_location: TaxLocation::new("CA", None),
        ..EngineOptions::default()
    });
    let basic = engine.monthly("Basic", "10.00").await;

    let local = engine.subscribe(&basic).await;
    let invoice = first_invoice(&engine, local.subscription_id).await;
    assert_eq!(invoice.tax_amount, dec("0.50"));
    assert_eq!(invoice.total, dec("10.50"));

    let abroad = engine.subscribe_at(&basic, germany()).await;
    let invoice = first_invoice(&engine, abroad.subscription_id).await;
    assert_eq!(invoice.tax_amount, dec("1.90"));
}

#[tokio::test]
async fn test_coupon_discounts_before_tax_and_consumes_one_redemption() {
    let engine = TestEngine::new();
    seed_coupon(&engine, "SAVE20", 2, true).await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe_at(&pro, germany()).await;
    let invoice = first_invoice(&engine, subscription.subscription_id).await;

    let discounted = engine
        .invoices
        .apply_coupon(invoice.invoice_id, "SAVE20")
        .await
        .unwrap();

    assert_eq!(discounted.coupon_code.as_deref(), Some("SAVE20"));
    assert_eq!(discounted.discount_amount, dec("6.00"));
    assert_eq!(discounted.tax_amount, dec("4.56"));
    assert_eq!(discounted.total, dec("28.56"));
    assert_eq!(discounted.amount_due, dec("28.56"));

    let coupon = engine.store.get_coupon("SAVE20").await.unwrap().unwrap();
    assert_eq!(coupon.redemptions_remaining, 1);

    // Re-applying the same code returns the invoice without another redemption.
    let again = engine
        .invoices
        .apply_coupon(invoice.invoice_id, "SAVE20")
        .await
        .unwrap();
    assert_eq!(again.total, dec("28.56"));
    let coupon = engine.store.get_coupon("SAVE20").await.unwrap().unwrap();
    assert_eq!(coupon.redemptions_remaining, 1);

    let stored = engine
        .store
        .get_invoice(invoice.invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.total, dec("28.56"));
}

#[tokio::test]
async fn test_second_coupon_on_same_invoice_is_rejected() {
    let engine = TestEngine::new();
    seed_coupon(&engine, "SAVE20", 5, true).await;
    seed_coupon(&engine, "FIVE", 5, true).await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&pro).await;
    let invoice = first_invoice(&engine, subscription.subscription_id).await;

    engine
        .invoices
        .apply_coupon(invoice.invoice_id, "SAVE20")
        .await
        .unwrap();
    let result = engine
        .invoices
        .apply_coupon(invoice.invoice_id, "FIVE")
        .await;
    assert!(matches!(result, Err(BillingError::Validation(_))));

    let five = engine.store.get_coupon("FIVE").await.unwrap().unwrap();
    assert_eq!(five.redemptions_remaining, 5);
}

#[tokio::test]
async fn test_exhausted_inactive_and_unknown_coupons_are_rejected() {
    let engine = TestEngine::new();
    seed_coupon(&engine, "FIVE", 1, true).await;
    seed_coupon(&engine, "SAVE20", 10, false).await;
    let basic = engine.monthly("Basic", "10.00").await;
    let first = engine.subscribe(&basic).await;
    let second = engine.subscribe(&basic).await;
    let first_invoice_id = first_invoice(&engine, first.subscription_id).await.invoice_id;
    let second_invoice_id = first_invoice(&engine, second.subscription_id).await.invoice_id;

    let applied = engine
        .invoices
        .apply_coupon(first_invoice_id, "FIVE")
        .await
        .unwrap();
    assert_eq!(applied.total, dec("5.00"));

    for code in ["FIVE", "SAVE20", "NOPE"] {
        let result = engine.invoices.apply_coupon(second_invoice_id, code).await;
        assert!(
            matches!(result, Err(BillingError::Validation(_))),
            "coupon {} should be rejected, got {:?}",
            code,
            result
        );
    }

    let untouched = engine
        .store
        .get_invoice(second_invoice_id)
        .await
        .unwrap()
        .unwrap();
    assert!(untouched.coupon_code.is_none());
    assert_eq!(untouched.total, dec("10.00"));
}

#[tokio::test]
async fn test_discount_is_capped_at_subtotal() {
    let engine = TestEngine::new();
    seed_coupon(&engine, "HUGE", 1, true).await;
    let basic = engine.monthly("Basic", "10.00").await;
    let subscription = engine.subscribe(&basic).await;
    let invoice = first_invoice(&engine, subscription.subscription_id).await;

    let discounted = engine
        .invoices
        .apply_coupon(invoice.invoice_id, "HUGE")
        .await
        .unwrap();

    assert_eq!(discounted.discount_amount, dec("10.00"));
    assert_eq!(discounted.total, dec("0"));
    assert_eq!(discounted.amount_due, dec("0"));
    assert!(discounted.next_payment_attempt_at.is_none());
}

#[tokio::test]
async fn test_coupon_on_paid_invoice_is_rejected() {
    let engine = TestEngine::new();
    seed_coupon(&engine, "SAVE20", 5, true).await;
    let basic = engine.monthly("Basic", "10.00").await;
    let subscription = engine.subscribe(&basic).await;
    let invoice = first_invoice(&engine, subscription.subscription_id).await;
    engine
        .manager
        .settle_payment(invoice.invoice_id, PaymentOutcome::Succeeded)
        .await
        .unwrap();

    let result = engine
        .invoices
        .apply_coupon(invoice.invoice_id, "SAVE20")
        .await;
    assert!(matches!(result, Err(BillingError::Validation(_))));
}

#[tokio::test]
async fn test_invoice_number_collision_rolls_back_whole_operation() {
    let engine = TestEngine::with_options(EngineOptions {
        invoice_numbers: Some(Arc::new(ScriptedInvoiceNumbers::new(&[
            "INV-202604-0001",
            "INV-202604-0001",
            "INV-202604-0002",
        ]))),
        ..EngineOptions::default()
    });
    let basic = engine.monthly("Basic", "10.00").await;
    engine.subscribe(&basic).await;

    let user_id = Uuid::new_v4();
    let input = CreateSubscription {
        user_id,
        plan_id: basic.plan_id,
        billing_location: None,
    };

    let collided = engine.manager.create(input.clone()).await;
    match collided {
        Err(err @ BillingError::InvoiceNumberCollision(_)) => assert!(err.is_retryable()),
        other => panic!("expected invoice number collision, got {:?}", other),
    }

    // Nothing from the failed attempt survived, so the retry is not a duplicate.
    let retried = engine.manager.create(input).await.unwrap();
    let invoice = first_invoice(&engine, retried.subscription_id).await;
    assert_eq!(invoice.invoice_number, "INV-202604-0002");
    assert_eq!(engine.history_for(retried.subscription_id).await.len(), 1);
}

#[tokio::test]
async fn test_tax_timeout_aborts_plan_change() {
    let engine = TestEngine::with_options(EngineOptions {
        tax: Arc::new(StalledTax),
        collaborator_timeout: Duration::from_millis(50),
        ..EngineOptions::default()
    });
    let free = engine.monthly("Free", "0").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let subscription = engine.subscribe(&free).await;
    engine.advance_days(15);

    let result = engine
        .manager
        .upgrade(subscription.subscription_id, pro.plan_id, 0)
        .await;
    assert!(matches!(result, Err(BillingError::Collaborator(_))));

    let unchanged = engine.subscription(subscription.subscription_id).await;
    assert_eq!(unchanged.plan_id, free.plan_id);
    assert_eq!(unchanged.version, 0);
    assert_eq!(engine.history_for(subscription.subscription_id).await.len(), 1);
    assert!(engine
        .invoices_for(subscription.subscription_id)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_tax_timeout_aborts_creation() {
    let engine = TestEngine::with_options(EngineOptions {
        tax: Arc::new(StalledTax),
        collaborator_timeout: Duration::from_millis(50),
        ..EngineOptions::default()
    });
    let free = engine.monthly("Free", "0").await;
    let pro = engine.monthly("Pro", "30.00").await;
    let user_id = Uuid::new_v4();

    let result = engine
        .manager
        .create(CreateSubscription {
            user_id,
            plan_id: pro.plan_id,
            billing_location: None,
        })
        .await;
    assert!(matches!(result, Err(BillingError::Collaborator(_))));

    // The failed creation left no live subscription behind.
    engine
        .manager
        .create(CreateSubscription {
            user_id,
            plan_id: free.plan_id,
            billing_location: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_void_invoice_is_idempotent_and_refuses_paid_invoices() {
    let engine = TestEngine::new();
    let basic = engine.monthly("Basic", "10.00").await;
    let first = engine.subscribe(&basic).await;
    let second = engine.subscribe(&basic).await;
    let open = first_invoice(&engine, first.subscription_id).await;
    let paid = first_invoice(&engine, second.subscription_id).await;

    let voided = engine.invoices.void_invoice(open.invoice_id).await.unwrap();
    assert_eq!(voided.status, InvoiceStatus::Void);
    assert_eq!(voided.amount_due, dec("0"));
    assert!(voided.next_payment_attempt_at.is_none());

    let again = engine.invoices.void_invoice(open.invoice_id).await.unwrap();
    assert_eq!(again.status, InvoiceStatus::Void);

    engine
        .manager
        .settle_payment(paid.invoice_id, PaymentOutcome::Succeeded)
        .await
        .unwrap();
    let result = engine.invoices.void_invoice(paid.invoice_id).await;
    assert!(matches!(result, Err(BillingError::Validation(_))));

    // Voided invoices are no longer collected.
    let summary = engine.orchestrator.run_once().await.unwrap();
    assert_eq!(summary.payments_collected, 0);
}

#[tokio::test]
async fn test_unknown_invoice_is_not_found() {
    let engine = TestEngine::new();

    let result = engine.invoices.apply_coupon(Uuid::new_v4(), "SAVE20").await;
    assert!(matches!(result, Err(BillingError::NotFound(_))));

    let result = engine.invoices.void_invoice(Uuid::new_v4()).await;
    assert!(matches!(result, Err(BillingError::NotFound(_))));
}
