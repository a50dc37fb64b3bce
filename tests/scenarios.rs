//! Crash and restart scenarios.
//!
//! Each test leaves effects and a partial saga journal on disk the way a
//! process killed mid-checkout would, then reopens the directory with the
//! same external collaborators and lets recovery finish the saga.

mod common;

use cellmart::core::ids::{ChargeId, OrderId, ReservationId, SagaId};
use cellmart::core::time::{Deadline, Timestamp};
use cellmart::saga::idempotency::request_digest;
use cellmart::saga::{
    CheckoutRequest, FailureReason, NewOrder, OrderStore, PaymentGateway, SagaRecord, SagaState,
    SagaStep, StepResults,
};
use cellmart::storage::{Journal, SyncMode};
use common::{card_checkout, new_collaborators, wallet_checkout, Harness, T0};
use std::path::Path;

const AT: Timestamp = Timestamp::new(T0);

/// Journal of a saga that died at some point; built up record by record.
struct CrashedSaga {
    id: SagaId,
    request: CheckoutRequest,
    records: Vec<SagaRecord>,
}

impl CrashedSaga {
    fn opened(request: CheckoutRequest) -> Self {
        let id = SagaId::generate();
        let request_digest = request_digest(&request).unwrap();
        Self {
            id,
            records: vec![SagaRecord::Opened {
                saga_id: id,
                request: request.clone(),
                request_digest,
                at: AT,
            }],
            request,
        }
    }

    fn entering(mut self, step: SagaStep, planned: StepResults) -> Self {
        self.records.push(SagaRecord::StepEntering {
            saga_id: self.id,
            step,
            planned,
            at: AT,
        });
        self
    }

    fn succeeded(mut self, step: SagaStep, results: StepResults) -> Self {
        self.records.push(SagaRecord::StepSucceeded {
            saga_id: self.id,
            step,
            results,
            at: AT,
        });
        self
    }

    fn write(&self, dir: &Path) {
        let journal: Journal<SagaRecord> =
            Journal::open(&dir.join("saga.wal"), SyncMode::Strict).unwrap();
        for record in &self.records {
            journal.append(record).unwrap();
        }
    }
}

fn reserved(id: ReservationId) -> StepResults {
    StepResults {
        reservation_id: Some(id),
        ..StepResults::default()
    }
}

fn charged(id: ChargeId) -> StepResults {
    StepResults {
        charge_id: Some(id),
        ..StepResults::default()
    }
}

fn ordered(id: OrderId) -> StepResults {
    StepResults {
        order_id: Some(id),
        ..StepResults::default()
    }
}

async fn recover_one(h: &Harness, saga_id: SagaId) -> cellmart::saga::CheckoutOutcome {
    assert_eq!(h.services.sagas.recover(), 1);
    h.services
        .sagas
        .wait(saga_id, Deadline::after_ms(10_000))
        .await
        .unwrap()
}

// ============================================================================
// Restart scenarios
// ============================================================================

#[tokio::test]
async fn crash_during_commit_completes_on_restart() {
    // S4: reserve, pay and order happened; the process died inside commit.
    let dir = tempfile::tempdir().unwrap();
    let collaborators = new_collaborators();
    let request = card_checkout("s4", "alice", "X", 2, "card");
    let reservation_id = ReservationId::generate();
    let order_id = OrderId::generate();

    let saga = {
        let h = Harness::reopen(dir.path(), collaborators.clone());
        h.services.ledger.add_stock("X", 10).unwrap();
        h.services
            .ledger
            .reserve_as(reservation_id, "X", 2, None, "alice")
            .unwrap();
        let charge_id = h.gateway.charge("s4", 200, "card").await.unwrap();
        let saga = CrashedSaga::opened(request.clone());
        h.orders
            .create(NewOrder {
                saga_id: saga.id,
                order_id,
                user_id: "alice".into(),
                sku: "X".into(),
                qty: 2,
                amount: 200,
            })
            .await
            .unwrap();
        saga.entering(SagaStep::Reserve, reserved(reservation_id))
            .succeeded(SagaStep::Reserve, reserved(reservation_id))
            .entering(SagaStep::Pay, StepResults::default())
            .succeeded(SagaStep::Pay, charged(charge_id))
            .entering(SagaStep::Order, ordered(order_id))
            .succeeded(SagaStep::Order, ordered(order_id))
            .entering(SagaStep::Commit, StepResults::default())
    };
    saga.write(dir.path());

    let h = Harness::reopen(dir.path(), collaborators);
    let parked = h.services.sagas.saga(saga.id).unwrap();
    assert_eq!(parked.state, SagaState::Committing);
    assert_eq!(h.services.ledger.account("X").unwrap().reserved, 2);

    let outcome = recover_one(&h, saga.id).await;
    assert_eq!(outcome.state, SagaState::Completed);
    assert_eq!(outcome.order_id, Some(order_id));
    let acct = h.services.ledger.account("X").unwrap();
    assert_eq!((acct.available, acct.reserved, acct.committed), (8, 0, 2));
    assert_eq!(h.gateway.settled_count(), 1);
    assert_eq!(h.orders.live_count(), 1);

    // The recorded outcome answers the original key.
    let again = h
        .services
        .sagas
        .checkout(request, Deadline::after_ms(1_000))
        .await
        .unwrap();
    assert_eq!(again, outcome);
}

#[tokio::test]
async fn commit_already_applied_before_crash_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let collaborators = new_collaborators();
    let reservation_id = ReservationId::generate();
    let order_id = OrderId::generate();

    let saga = {
        let h = Harness::reopen(dir.path(), collaborators.clone());
        h.services.ledger.add_stock("X", 3).unwrap();
        h.services
            .ledger
            .reserve_as(reservation_id, "X", 1, None, "alice")
            .unwrap();
        let charge_id = h.gateway.charge("done", 100, "card").await.unwrap();
        // Commit landed; its StepSucceeded did not.
        h.services.ledger.commit(reservation_id).unwrap();
        CrashedSaga::opened(card_checkout("done", "alice", "X", 1, "card"))
            .entering(SagaStep::Reserve, reserved(reservation_id))
            .succeeded(SagaStep::Reserve, reserved(reservation_id))
            .entering(SagaStep::Pay, StepResults::default())
            .succeeded(SagaStep::Pay, charged(charge_id))
            .entering(SagaStep::Order, ordered(order_id))
            .succeeded(SagaStep::Order, ordered(order_id))
            .entering(SagaStep::Commit, StepResults::default())
    };
    saga.write(dir.path());

    let h = Harness::reopen(dir.path(), collaborators);
    let outcome = recover_one(&h, saga.id).await;
    assert_eq!(outcome.state, SagaState::Completed);
    assert_eq!(h.services.ledger.account("X").unwrap().committed, 1);
}

#[tokio::test]
async fn payment_in_doubt_is_refunded_on_restart() {
    // The charge went through but the process died before journaling it.
    let dir = tempfile::tempdir().unwrap();
    let collaborators = new_collaborators();
    let reservation_id = ReservationId::generate();

    let (saga, charge_id) = {
        let h = Harness::reopen(dir.path(), collaborators.clone());
        h.services.ledger.add_stock("X", 5).unwrap();
        h.services
            .ledger
            .reserve_as(reservation_id, "X", 1, None, "alice")
            .unwrap();
        let charge_id = h.gateway.charge("doubt", 100, "card").await.unwrap();
        let saga = CrashedSaga::opened(card_checkout("doubt", "alice", "X", 1, "card"))
            .entering(SagaStep::Reserve, reserved(reservation_id))
            .succeeded(SagaStep::Reserve, reserved(reservation_id))
            .entering(SagaStep::Pay, StepResults::default());
        (saga, charge_id)
    };
    saga.write(dir.path());

    let h = Harness::reopen(dir.path(), collaborators);
    assert_eq!(h.services.sagas.saga(saga.id).unwrap().state, SagaState::Paying);
    let outcome = recover_one(&h, saga.id).await;
    assert_eq!(outcome.state, SagaState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::TryAgain));
    assert!(h.gateway.is_refunded(charge_id));
    assert_eq!(h.gateway.settled_count(), 0);
    assert_eq!(h.services.ledger.available("X"), 5);

    let saga = h.services.sagas.saga(saga.id).unwrap();
    assert_eq!(saga.uncertain, vec![SagaStep::Pay]);
    assert_eq!(saga.compensated, vec![SagaStep::Pay, SagaStep::Reserve]);
}

#[tokio::test]
async fn payment_never_sent_is_not_charged_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let collaborators = new_collaborators();
    let reservation_id = ReservationId::generate();

    let saga = {
        let h = Harness::reopen(dir.path(), collaborators.clone());
        h.services.ledger.add_stock("X", 5).unwrap();
        h.services
            .ledger
            .reserve_as(reservation_id, "X", 1, None, "alice")
            .unwrap();
        CrashedSaga::opened(card_checkout("unsent", "alice", "X", 1, "card-declined"))
            .entering(SagaStep::Reserve, reserved(reservation_id))
            .succeeded(SagaStep::Reserve, reserved(reservation_id))
            .entering(SagaStep::Pay, StepResults::default())
    };
    saga.write(dir.path());

    let h = Harness::reopen(dir.path(), collaborators);
    // The lookup charge made during compensation is declined, so nothing to refund.
    h.gateway.decline_method("card-declined");
    let outcome = recover_one(&h, saga.id).await;
    assert_eq!(outcome.state, SagaState::Failed);
    assert!(h.gateway.charge_for("unsent").is_none());
    assert_eq!(h.services.ledger.available("X"), 5);
}

#[tokio::test]
async fn reserve_in_doubt_is_retried_under_the_same_id() {
    let dir = tempfile::tempdir().unwrap();
    let collaborators = new_collaborators();
    let reservation_id = ReservationId::generate();

    let saga = {
        let h = Harness::reopen(dir.path(), collaborators.clone());
        h.services.ledger.add_stock("X", 5).unwrap();
        // The reservation was made, its success never journaled.
        h.services
            .ledger
            .reserve_as(reservation_id, "X", 1, None, "alice")
            .unwrap();
        CrashedSaga::opened(card_checkout("retry", "alice", "X", 1, "card"))
            .entering(SagaStep::Reserve, reserved(reservation_id))
    };
    saga.write(dir.path());

    let h = Harness::reopen(dir.path(), collaborators);
    let outcome = recover_one(&h, saga.id).await;
    assert_eq!(outcome.state, SagaState::Completed);
    assert_eq!(h.services.ledger.reservations_for("X").len(), 1);
    assert_eq!(h.services.ledger.available("X"), 4);
    assert_eq!(
        h.services.sagas.saga(saga.id).unwrap().results.reservation_id,
        Some(reservation_id)
    );
}

#[tokio::test]
async fn wallet_escrow_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let collaborators = new_collaborators();
    let reservation_id = ReservationId::generate();

    let saga = {
        let h = Harness::reopen(dir.path(), collaborators.clone());
        h.services.ledger.add_stock("X", 2).unwrap();
        h.services.wallet.deposit("alice", "USD", 500).unwrap();
        h.services
            .ledger
            .reserve_as(reservation_id, "X", 1, None, "alice")
            .unwrap();
        let hold_id = h.services.wallet.hold("alice", "USD", 250, "esc").unwrap();
        CrashedSaga::opened(wallet_checkout("esc", "alice", "X", 1, 250, "shop"))
            .entering(SagaStep::Reserve, reserved(reservation_id))
            .succeeded(SagaStep::Reserve, reserved(reservation_id))
            .entering(SagaStep::Pay, StepResults::default())
            .succeeded(
                SagaStep::Pay,
                StepResults {
                    hold_id: Some(hold_id),
                    ..StepResults::default()
                },
            )
    };
    saga.write(dir.path());

    let h = Harness::reopen(dir.path(), collaborators);
    assert_eq!(h.services.wallet.balance("alice", "USD").held, 250);
    let outcome = recover_one(&h, saga.id).await;
    assert_eq!(outcome.state, SagaState::Completed);
    let buyer = h.services.wallet.balance("alice", "USD");
    assert_eq!((buyer.available, buyer.held), (250, 0));
    assert_eq!(h.services.wallet.balance("shop", "USD").available, 250);
    assert!(h.services.wallet.reconcile("alice", "USD").matches());
}

#[tokio::test]
async fn finished_sagas_are_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let collaborators = new_collaborators();
    let outcome = {
        let h = Harness::reopen(dir.path(), collaborators.clone());
        h.services.ledger.add_stock("X", 2).unwrap();
        h.services
            .sagas
            .checkout(card_checkout("fin", "alice", "X", 1, "card"), Deadline::after_ms(5_000))
            .await
            .unwrap()
    };

    let h = Harness::reopen(dir.path(), collaborators);
    assert_eq!(h.services.sagas.recover(), 0);
    assert_eq!(h.services.sagas.get("fin").unwrap().outcome, Some(outcome.clone()));
    let again = h
        .services
        .sagas
        .checkout(card_checkout("fin", "alice", "X", 1, "card"), Deadline::after_ms(1_000))
        .await
        .unwrap();
    assert_eq!(again, outcome);
    assert_eq!(h.gateway.settled_count(), 1);
    assert_eq!(h.services.ledger.account("X").unwrap().committed, 1);
}
