//! Checkout saga tests.

mod common;

use cellmart::core::error::CoreError;
use cellmart::core::time::{Deadline, Timestamp};
use cellmart::flash::{pow, NewFlashSale, PurchaseAttempt};
use cellmart::ops::observability::metrics;
use cellmart::saga::{CheckoutOutcome, CheckoutRequest, FailureReason, SagaState, SagaStep};
use common::{card_checkout, wallet_checkout, Harness, T0};
use std::sync::Arc;
use std::time::Duration;

async fn run(h: &Harness, request: CheckoutRequest) -> CheckoutOutcome {
    h.services
        .sagas
        .checkout(request, Deadline::after_ms(10_000))
        .await
        .unwrap()
}

fn stocked(qty: u64) -> Harness {
    let h = Harness::in_memory();
    h.services.ledger.add_stock("X", qty).unwrap();
    h
}

// ============================================================================
// Forward path tests
// ============================================================================

#[tokio::test]
async fn card_checkout_completes_every_step() {
    let h = stocked(10);
    let outcome = run(&h, card_checkout("k1", "alice", "X", 2, "card")).await;
    assert_eq!(outcome.state, SagaState::Completed);
    assert!(outcome.failure.is_none());
    let order_id = outcome.order_id.expect("completed checkout has an order");

    let acct = h.services.ledger.account("X").unwrap();
    assert_eq!((acct.available, acct.reserved, acct.committed), (8, 0, 2));
    assert_eq!(h.gateway.settled_count(), 1);
    assert!(h.gateway.charge_for("k1").is_some());
    let order = h.orders.for_saga(outcome.saga_id).unwrap();
    assert_eq!(order.order_id, order_id);
    assert_eq!(order.amount, 200);

    let saga = h.services.sagas.get("k1").unwrap();
    assert_eq!(saga.completed, SagaStep::ALL.to_vec());
    assert!(saga.compensated.is_empty());
    assert_eq!(saga.outcome, Some(outcome));
    assert_eq!(h.services.metrics.counter_get(metrics::SAGA_COMPLETED_TOTAL), 1);
}

#[tokio::test]
async fn wallet_checkout_settles_escrow_to_payee() {
    let h = stocked(5);
    h.services.wallet.deposit("alice", "USD", 1_000).unwrap();

    let outcome = run(&h, wallet_checkout("w1", "alice", "X", 1, 300, "shop")).await;
    assert_eq!(outcome.state, SagaState::Completed);

    let buyer = h.services.wallet.balance("alice", "USD");
    let seller = h.services.wallet.balance("shop", "USD");
    assert_eq!((buyer.available, buyer.held), (700, 0));
    assert_eq!(seller.available, 300);
    assert_eq!(h.gateway.settled_count(), 0);
    let hold = h.services.wallet.hold_by_ref("w1").unwrap();
    assert!(!hold.is_open());
}

#[tokio::test]
async fn invalid_request_opens_no_saga() {
    let h = stocked(5);
    let mut request = card_checkout("", "alice", "X", 1, "card");
    assert!(matches!(
        h.services.sagas.checkout(request.clone(), Deadline::after_ms(1_000)).await,
        Err(CoreError::InvalidInput { .. })
    ));
    request.idempotency_key = "k".into();
    request.qty = 0;
    assert!(h
        .services
        .sagas
        .checkout(request, Deadline::after_ms(1_000))
        .await
        .is_err());
    assert!(h.services.sagas.is_empty());
}

// ============================================================================
// Idempotency tests
// ============================================================================

#[tokio::test]
async fn finished_key_returns_recorded_outcome() {
    let h = stocked(10);
    let first = run(&h, card_checkout("k", "alice", "X", 1, "card")).await;
    let again = run(&h, card_checkout("k", "alice", "X", 1, "card")).await;
    assert_eq!(first, again);
    assert_eq!(h.services.sagas.len(), 1);
    assert_eq!(h.services.ledger.available("X"), 9);
    assert_eq!(h.gateway.settled_count(), 1);
}

#[tokio::test]
async fn key_reused_with_different_request_conflicts() {
    let h = stocked(10);
    run(&h, card_checkout("k", "alice", "X", 1, "card")).await;
    let err = h
        .services
        .sagas
        .checkout(card_checkout("k", "alice", "X", 3, "card"), Deadline::after_ms(1_000))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_share_one_saga() {
    // S2: same key twice, one charge.
    let h = stocked(10);
    h.gateway.set_latency(Duration::from_millis(200));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let sagas = h.services.sagas.clone();
        handles.push(tokio::spawn(async move {
            sagas
                .checkout(card_checkout("dup", "alice", "X", 1, "card"), Deadline::after_ms(10_000))
                .await
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    for outcome in &outcomes {
        assert_eq!(outcome, &outcomes[0]);
        assert_eq!(outcome.state, SagaState::Completed);
    }
    assert_eq!(h.services.sagas.len(), 1);
    assert_eq!(h.gateway.settled_count(), 1);
    assert_eq!(h.orders.live_count(), 1);
    assert_eq!(h.services.ledger.available("X"), 9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_opens_journal_every_saga_before_its_steps() {
    let dir = tempfile::tempdir().unwrap();
    let collaborators = common::new_collaborators();
    let keys: Vec<String> = (0..6).map(|i| format!("race-{i}")).collect();
    let live = {
        let h = Harness::reopen(dir.path(), collaborators.clone());
        h.services.ledger.add_stock("X", 20).unwrap();
        let mut handles = Vec::new();
        for key in &keys {
            for _ in 0..4 {
                let sagas = h.services.sagas.clone();
                let key = key.clone();
                handles.push(tokio::spawn(async move {
                    sagas
                        .checkout(card_checkout(&key, "alice", "X", 1, "card"), Deadline::after_ms(10_000))
                        .await
                }));
            }
            // A cancel landing while the key is only just bound.
            match h.services.sagas.cancel(key) {
                Ok(_) | Err(CoreError::NotFound { .. }) | Err(CoreError::Conflict { .. }) => {}
                Err(e) => panic!("unexpected cancel error: {e}"),
            }
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(h.services.sagas.len(), keys.len());
        keys.iter()
            .map(|key| h.services.sagas.get(key).unwrap())
            .collect::<Vec<_>>()
    };

    let h = Harness::reopen(dir.path(), collaborators);
    assert_eq!(h.services.sagas.len(), keys.len());
    for saga in live {
        let replayed = h.services.sagas.get(&saga.idempotency_key).unwrap();
        assert_eq!(replayed.id, saga.id);
        assert_eq!(replayed.outcome, saga.outcome);
        assert!(!replayed.needs_attention);
    }
}

#[tokio::test]
async fn caller_deadline_does_not_abort_the_saga() {
    let h = stocked(3);
    h.gateway.set_latency(Duration::from_millis(150));
    let err = h
        .services
        .sagas
        .checkout(card_checkout("slow", "alice", "X", 1, "card"), Deadline::after_ms(20))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DeadlineExceeded { .. }));

    let saga_id = h.services.sagas.get("slow").unwrap().id;
    let outcome = h
        .services
        .sagas
        .wait(saga_id, Deadline::after_ms(5_000))
        .await
        .unwrap();
    assert_eq!(outcome.state, SagaState::Completed);
}

// ============================================================================
// Compensation tests
// ============================================================================

#[tokio::test]
async fn declined_card_releases_stock() {
    // S3: decline on pay; reserve is compensated.
    let h = stocked(10);
    h.gateway.decline_method("card-declined");
    let outcome = run(&h, card_checkout("k", "alice", "X", 1, "card-declined")).await;
    assert_eq!(outcome.state, SagaState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::PaymentDeclined));
    assert!(outcome.order_id.is_none());

    assert_eq!(h.services.ledger.available("X"), 10);
    assert_eq!(h.services.ledger.account("X").unwrap().reserved, 0);
    assert_eq!(h.orders.live_count(), 0);
    assert!(h.gateway.charge_for("k").is_none());
    let saga = h.services.sagas.get("k").unwrap();
    assert_eq!(saga.compensated, vec![SagaStep::Reserve]);
    assert!(!saga.needs_attention);
}

#[tokio::test]
async fn missing_stock_fails_sold_out() {
    let h = stocked(1);
    let outcome = run(&h, card_checkout("k", "alice", "X", 2, "card")).await;
    assert_eq!(outcome.failure, Some(FailureReason::SoldOut));
    assert!(h.gateway.charge_for("k").is_none());
    assert_eq!(h.services.ledger.available("X"), 1);
}

#[tokio::test]
async fn wallet_shortfall_is_payment_declined() {
    let h = stocked(5);
    h.services.wallet.deposit("alice", "USD", 100).unwrap();
    let outcome = run(&h, wallet_checkout("k", "alice", "X", 1, 300, "shop")).await;
    assert_eq!(outcome.failure, Some(FailureReason::PaymentDeclined));
    assert_eq!(h.services.wallet.balance("alice", "USD").available, 100);
    assert_eq!(h.services.wallet.balance("shop", "USD").available, 0);
    assert_eq!(h.services.ledger.available("X"), 5);
}

#[tokio::test]
async fn order_outage_refunds_and_releases() {
    let h = stocked(5);
    h.orders.set_fail_creates(true);
    let outcome = run(&h, card_checkout("k", "alice", "X", 2, "card")).await;
    assert_eq!(outcome.state, SagaState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::TryAgain));

    let charge = h.gateway.charge_for("k").unwrap();
    assert!(h.gateway.is_refunded(charge));
    assert_eq!(h.gateway.settled_count(), 0);
    assert_eq!(h.services.ledger.available("X"), 5);
    let saga = h.services.sagas.get("k").unwrap();
    assert_eq!(
        saga.compensated,
        vec![SagaStep::Order, SagaStep::Pay, SagaStep::Reserve]
    );
}

#[tokio::test]
async fn failed_compensation_is_flagged_until_retried() {
    let h = stocked(5);
    h.orders.set_fail_creates(true);
    h.gateway.set_fail_refunds(true);

    let outcome = run(&h, card_checkout("k", "alice", "X", 1, "card")).await;
    assert_eq!(outcome.state, SagaState::Failed);
    let flagged = h.services.sagas.flagged();
    assert_eq!(flagged.len(), 1);
    assert!(flagged[0].needs_attention);
    assert_eq!(flagged[0].pending_compensations(), vec![SagaStep::Pay]);
    // Stock came back even though the refund did not.
    assert_eq!(h.services.ledger.available("X"), 5);
    assert_eq!(h.gateway.settled_count(), 1);

    h.gateway.set_fail_refunds(false);
    let saga = h
        .services
        .sagas
        .retry_compensations(outcome.saga_id)
        .await
        .unwrap();
    assert!(!saga.needs_attention);
    assert!(saga.pending_compensations().is_empty());
    assert_eq!(h.gateway.settled_count(), 0);
    assert!(h.services.sagas.flagged().is_empty());
    // The recorded outcome does not change.
    assert_eq!(saga.outcome, Some(outcome));
}

// ============================================================================
// Cancellation tests
// ============================================================================

#[tokio::test]
async fn cancel_during_payment_unwinds() {
    let h = stocked(4);
    h.gateway.set_latency(Duration::from_millis(200));
    let sagas = h.services.sagas.clone();
    let task = tokio::spawn(async move {
        sagas
            .checkout(card_checkout("c", "alice", "X", 1, "card"), Deadline::after_ms(10_000))
            .await
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(saga) = h.services.sagas.get("c") {
            if saga.state == SagaState::Paying {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "saga never reached paying");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.services.sagas.cancel("c").unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.state, SagaState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    assert_eq!(h.services.ledger.available("X"), 4);
    assert_eq!(h.gateway.settled_count(), 0);
    assert_eq!(h.orders.live_count(), 0);

    // Cancelling a failed saga returns its outcome.
    assert_eq!(h.services.sagas.cancel("c").unwrap(), outcome);
}

#[tokio::test]
async fn cancel_rejected_once_completed() {
    let h = stocked(4);
    run(&h, card_checkout("done", "alice", "X", 1, "card")).await;
    assert!(matches!(
        h.services.sagas.cancel("done"),
        Err(CoreError::Conflict { .. })
    ));
    assert!(matches!(
        h.services.sagas.cancel("unknown"),
        Err(CoreError::NotFound { .. })
    ));
}

// ============================================================================
// Flash-sale checkout tests
// ============================================================================

async fn flash_hold(h: &Harness, user: &str) -> (cellmart::flash::FlashSale, cellmart::ledger::Reservation) {
    let sale = h
        .services
        .flash
        .create_sale(NewFlashSale {
            sku: "drop".into(),
            original_price: 200,
            sale_price: 100,
            total_qty: 3,
            max_per_user: 1,
            start: Timestamp::new(T0),
            end: Timestamp::new(T0 + 60_000),
        })
        .unwrap();
    let issue = h.services.flash.get_challenge(sale.id, user).unwrap();
    let nonce = pow::solve(&pow::decode_challenge(&issue.challenge).unwrap(), issue.difficulty).unwrap();
    let hold = h
        .services
        .flash
        .attempt_purchase(
            PurchaseAttempt {
                sale_id: sale.id,
                user_id: user.to_string(),
                qty: 1,
                challenge: issue.challenge,
                nonce,
                source: None,
            },
            Deadline::after_ms(5_000),
        )
        .await
        .unwrap();
    (sale, hold)
}

#[tokio::test]
async fn checkout_adopts_flash_hold() {
    let h = Arc::new(Harness::in_memory());
    let (sale, hold) = flash_hold(&h, "alice").await;

    let mut request = card_checkout("f1", "alice", "drop", 1, "card");
    request.flash_reservation = Some(hold.id);
    let outcome = run(&h, request).await;
    assert_eq!(outcome.state, SagaState::Completed);

    let saga = h.services.sagas.get("f1").unwrap();
    assert_eq!(saga.results.reservation_id, Some(hold.id));
    let sale = h.services.flash.sale(sale.id).unwrap();
    assert_eq!(sale.sold_qty, 1);
    assert_eq!(h.services.ledger.account(&sale.stock_key()).unwrap().committed, 1);
    // The sale records the saga's order.
    assert_eq!(
        h.services.flash.confirm_purchase(hold.id, "alice").unwrap(),
        outcome.order_id.unwrap()
    );
}

#[tokio::test]
async fn foreign_flash_hold_is_refused() {
    let h = Harness::in_memory();
    let (sale, hold) = flash_hold(&h, "alice").await;

    let mut request = card_checkout("f2", "mallory", "drop", 1, "card");
    request.flash_reservation = Some(hold.id);
    let outcome = run(&h, request).await;
    assert_eq!(outcome.state, SagaState::Failed);
    assert!(h.gateway.charge_for("f2").is_none());
    // Alice's hold is untouched.
    assert!(h.services.ledger.reservation(hold.id).unwrap().is_pending());
    assert_eq!(h.services.flash.sale(sale.id).unwrap().sold_qty, 0);
}

#[tokio::test]
async fn flash_hold_backs_one_checkout_only() {
    let h = Harness::in_memory();
    let (sale, hold) = flash_hold(&h, "alice").await;
    h.gateway.set_latency(Duration::from_millis(300));

    let mut first = card_checkout("fa", "alice", "drop", 1, "card");
    first.flash_reservation = Some(hold.id);
    let mut second = card_checkout("fb", "alice", "drop", 1, "card");
    second.flash_reservation = Some(hold.id);
    let (a, b) = tokio::join!(run(&h, first), run(&h, second));

    let outcomes = [a, b];
    let completed: Vec<&CheckoutOutcome> = outcomes
        .iter()
        .filter(|o| o.state == SagaState::Completed)
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(
        outcomes.iter().filter(|o| o.state == SagaState::Failed).count(),
        1
    );
    assert_eq!(h.orders.live_count(), 1);
    assert_eq!(h.gateway.settled_count(), 1);
    assert_eq!(h.services.flash.sale(sale.id).unwrap().sold_qty, 1);
    let acct = h.services.ledger.account(&sale.stock_key()).unwrap();
    assert_eq!((acct.committed, acct.reserved), (1, 0));
    assert_eq!(
        h.services.flash.confirm_purchase(hold.id, "alice").unwrap(),
        completed[0].order_id.unwrap()
    );
}

#[tokio::test]
async fn claimed_flash_hold_confirms_only_through_its_checkout() {
    let h = Arc::new(Harness::in_memory());
    let (_sale, hold) = flash_hold(&h, "alice").await;
    h.gateway.set_latency(Duration::from_millis(300));

    let mut request = card_checkout("fc", "alice", "drop", 1, "card");
    request.flash_reservation = Some(hold.id);
    let driver = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { run(&h, request).await })
    };
    while h.services.flash.claimant(hold.id).is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Mid-payment the buyer cannot confirm the hold around the checkout.
    assert!(matches!(
        h.services.flash.confirm_purchase(hold.id, "alice"),
        Err(CoreError::Conflict { .. })
    ));
    let outcome = driver.await.unwrap();
    assert_eq!(outcome.state, SagaState::Completed);
    assert_eq!(
        h.services.flash.claimant(hold.id),
        Some(outcome.saga_id.to_string())
    );
}

#[tokio::test]
async fn losing_checkout_leaves_claimed_hold_alone() {
    let h = Harness::in_memory();
    let (sale, hold) = flash_hold(&h, "alice").await;
    let claimant = "sag_elsewhere";
    h.services.flash.claim(hold.id, "alice", claimant).unwrap();
    // Repeating the same claim is harmless.
    h.services.flash.claim(hold.id, "alice", claimant).unwrap();

    let mut request = card_checkout("fd", "alice", "drop", 1, "card");
    request.flash_reservation = Some(hold.id);
    let outcome = run(&h, request).await;
    assert_eq!(outcome.state, SagaState::Failed);
    assert!(h.gateway.charge_for("fd").is_none());
    assert!(h.services.ledger.reservation(hold.id).unwrap().is_pending());
    assert_eq!(h.services.flash.claimant(hold.id).as_deref(), Some(claimant));
    assert_eq!(h.services.flash.sale(sale.id).unwrap().sold_qty, 0);
}
