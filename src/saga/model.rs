//! Checkout saga state.
//!
//! ```text
//! initiated → reserving → paying → ordering → committing → completed
//!      │          │          │         │
//!      └─────▶ compensating ◀┴─────────┘──▶ failed
//! ```
//!
//! A [`Saga`] is rebuilt by folding its journal records through
//! [`Saga::apply`]; the live orchestrator uses the same fold after each
//! append, so replayed and live state cannot drift apart.

use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::{ChargeId, HoldId, OrderId, ReservationId, SagaId};
use crate::core::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Initiated,
    Reserving,
    Paying,
    Ordering,
    Committing,
    Completed,
    Compensating,
    Failed,
}

impl SagaState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Reserving => "reserving",
            Self::Paying => "paying",
            Self::Ordering => "ordering",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// External cancel is honored only before ordering begins.
    pub const fn allows_cancel(self) -> bool {
        matches!(self, Self::Initiated | Self::Reserving | Self::Paying)
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStep {
    Reserve,
    Pay,
    Order,
    Commit,
}

impl SagaStep {
    pub const ALL: [SagaStep; 4] = [Self::Reserve, Self::Pay, Self::Order, Self::Commit];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reserve => "reserve",
            Self::Pay => "pay",
            Self::Order => "order",
            Self::Commit => "commit",
        }
    }

    /// Saga state while this step runs.
    pub const fn state(self) -> SagaState {
        match self {
            Self::Reserve => SagaState::Reserving,
            Self::Pay => SagaState::Paying,
            Self::Order => SagaState::Ordering,
            Self::Commit => SagaState::Committing,
        }
    }

    /// Whether an in-doubt attempt (entered, never succeeded) may simply be
    /// retried after a restart. Reserve and order are keyed by ids recorded
    /// before entry; commit is idempotent against already-terminal effects.
    /// An in-doubt payment is compensated instead.
    pub const fn retry_safe(self) -> bool {
        !matches!(self, Self::Pay)
    }

    pub fn next(self) -> Option<SagaStep> {
        match self {
            Self::Reserve => Some(Self::Pay),
            Self::Pay => Some(Self::Order),
            Self::Order => Some(Self::Commit),
            Self::Commit => None,
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the buyer pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Charge an external gateway.
    Gateway { method: String },
    /// Escrow funds in the buyer's wallet, released to the payee on commit.
    Wallet {
        currency: String,
        payee_user_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub idempotency_key: String,
    pub user_id: String,
    pub sku: String,
    pub qty: u64,
    /// Total price in minor units.
    pub amount: u64,
    pub payment: PaymentMethod,
    /// A hold already granted by flash-sale admission; the reserve step
    /// adopts it instead of reserving again.
    #[serde(default)]
    pub flash_reservation: Option<ReservationId>,
    /// Opaque to the core.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CheckoutRequest {
    pub fn validate(&self) -> CoreResult<()> {
        if self.idempotency_key.is_empty() {
            return Err(CoreError::invalid_input("idempotency_key is required"));
        }
        if self.user_id.is_empty() {
            return Err(CoreError::invalid_input("user_id is required"));
        }
        if self.flash_reservation.is_none() {
            if self.sku.is_empty() {
                return Err(CoreError::invalid_input("sku is required"));
            }
            if self.qty == 0 {
                return Err(CoreError::invalid_input("qty must be > 0"));
            }
        }
        match &self.payment {
            PaymentMethod::Gateway { method } if method.is_empty() => {
                return Err(CoreError::invalid_input("payment method is required"));
            }
            PaymentMethod::Wallet {
                currency,
                payee_user_id,
            } => {
                if currency.is_empty() || payee_user_id.is_empty() {
                    return Err(CoreError::invalid_input(
                        "wallet payment needs currency and payee",
                    ));
                }
                if self.amount == 0 {
                    return Err(CoreError::invalid_input("wallet payment amount must be > 0"));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Identifiers of external effects, filled in as steps succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResults {
    pub reservation_id: Option<ReservationId>,
    pub charge_id: Option<ChargeId>,
    pub hold_id: Option<HoldId>,
    pub order_id: Option<OrderId>,
}

impl StepResults {
    /// Overwrite with every field `other` sets.
    pub fn merge(&mut self, other: &StepResults) {
        if other.reservation_id.is_some() {
            self.reservation_id = other.reservation_id;
        }
        if other.charge_id.is_some() {
            self.charge_id = other.charge_id;
        }
        if other.hold_id.is_some() {
            self.hold_id = other.hold_id;
        }
        if other.order_id.is_some() {
            self.order_id = other.order_id;
        }
    }
}

/// The single user-facing reason of a failed checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    SoldOut,
    PaymentDeclined,
    TryAgain,
    Cancelled,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SoldOut => "sold_out",
            Self::PaymentDeclined => "payment_declined",
            Self::TryAgain => "try_again",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a step failure.
    pub fn classify(err: &CoreError) -> Self {
        match err {
            CoreError::InsufficientStock { .. }
            | CoreError::SoldOut { .. }
            | CoreError::NotActive { .. } => Self::SoldOut,
            CoreError::PaymentDeclined { .. } | CoreError::InsufficientFunds { .. } => {
                Self::PaymentDeclined
            }
            _ => Self::TryAgain,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a checkout caller receives. Terminal outcomes are recorded once and
/// returned verbatim to every later caller with the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutOutcome {
    pub saga_id: SagaId,
    pub state: SagaState,
    pub order_id: Option<OrderId>,
    pub failure: Option<FailureReason>,
}

/// Journal records of `saga.wal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaRecord {
    Opened {
        saga_id: SagaId,
        request: CheckoutRequest,
        request_digest: String,
        at: Timestamp,
    },
    /// Written before a forward step, with the ids the step will use.
    StepEntering {
        saga_id: SagaId,
        step: SagaStep,
        planned: StepResults,
        at: Timestamp,
    },
    StepSucceeded {
        saga_id: SagaId,
        step: SagaStep,
        results: StepResults,
        at: Timestamp,
    },
    StepFailed {
        saga_id: SagaId,
        step: SagaStep,
        error: String,
        reason: FailureReason,
        /// The effect may have happened anyway (timeout, lost connection).
        in_doubt: bool,
        at: Timestamp,
    },
    CancelRequested {
        saga_id: SagaId,
        at: Timestamp,
    },
    CompensationDone {
        saga_id: SagaId,
        step: SagaStep,
        at: Timestamp,
    },
    /// A compensation could not complete; operator attention required.
    Flagged {
        saga_id: SagaId,
        step: SagaStep,
        detail: String,
        at: Timestamp,
    },
    /// Every outstanding compensation finished after a flag.
    Resolved {
        saga_id: SagaId,
        at: Timestamp,
    },
    /// Terminal outcome plus the SHA-256 of its serialized form.
    Closed {
        saga_id: SagaId,
        outcome: CheckoutOutcome,
        digest: String,
        at: Timestamp,
    },
}

impl SagaRecord {
    pub fn saga_id(&self) -> SagaId {
        match self {
            Self::Opened { saga_id, .. }
            | Self::StepEntering { saga_id, .. }
            | Self::StepSucceeded { saga_id, .. }
            | Self::StepFailed { saga_id, .. }
            | Self::CancelRequested { saga_id, .. }
            | Self::CompensationDone { saga_id, .. }
            | Self::Flagged { saga_id, .. }
            | Self::Resolved { saga_id, .. }
            | Self::Closed { saga_id, .. } => *saga_id,
        }
    }
}

/// One checkout workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Saga {
    pub id: SagaId,
    pub idempotency_key: String,
    pub request: CheckoutRequest,
    pub request_digest: String,
    pub state: SagaState,
    /// Ids of succeeded effects.
    pub results: StepResults,
    /// Ids planned by every `StepEntering` so far.
    pub planned: StepResults,
    /// Forward steps that succeeded, in order.
    pub completed: Vec<SagaStep>,
    /// Steps that failed without a definite answer.
    pub uncertain: Vec<SagaStep>,
    /// Step entered but not yet resolved.
    pub in_flight: Option<SagaStep>,
    pub compensated: Vec<SagaStep>,
    pub failure: Option<FailureReason>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub needs_attention: bool,
    pub outcome: Option<CheckoutOutcome>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Saga {
    pub fn open(id: SagaId, request: CheckoutRequest, request_digest: String, at: Timestamp) -> Self {
        Self {
            id,
            idempotency_key: request.idempotency_key.clone(),
            request,
            request_digest,
            state: SagaState::Initiated,
            results: StepResults::default(),
            planned: StepResults::default(),
            completed: Vec::new(),
            uncertain: Vec::new(),
            in_flight: None,
            compensated: Vec::new(),
            failure: None,
            error: None,
            cancel_requested: false,
            needs_attention: false,
            outcome: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// Fold one journal record into the saga.
    pub fn apply(&mut self, record: &SagaRecord) {
        match record {
            SagaRecord::Opened { at, .. } => self.updated_at = *at,
            SagaRecord::StepEntering {
                step, planned, at, ..
            } => {
                self.state = step.state();
                self.in_flight = Some(*step);
                self.planned.merge(planned);
                self.updated_at = *at;
            }
            SagaRecord::StepSucceeded {
                step, results, at, ..
            } => {
                self.results.merge(results);
                if !self.completed.contains(step) {
                    self.completed.push(*step);
                }
                if self.in_flight == Some(*step) {
                    self.in_flight = None;
                }
                self.updated_at = *at;
            }
            SagaRecord::StepFailed {
                step,
                error,
                reason,
                in_doubt,
                at,
                ..
            } => {
                self.state = SagaState::Compensating;
                if self.in_flight == Some(*step) {
                    self.in_flight = None;
                }
                if *in_doubt && !self.uncertain.contains(step) {
                    self.uncertain.push(*step);
                }
                self.failure = Some(*reason);
                self.error = Some(error.clone());
                self.updated_at = *at;
            }
            SagaRecord::CancelRequested { at, .. } => {
                self.cancel_requested = true;
                self.updated_at = *at;
            }
            SagaRecord::CompensationDone { step, at, .. } => {
                if !self.compensated.contains(step) {
                    self.compensated.push(*step);
                }
                self.updated_at = *at;
            }
            SagaRecord::Flagged { detail, at, .. } => {
                self.needs_attention = true;
                self.error = Some(detail.clone());
                self.updated_at = *at;
            }
            SagaRecord::Resolved { at, .. } => {
                self.needs_attention = false;
                self.updated_at = *at;
            }
            SagaRecord::Closed { outcome, at, .. } => {
                self.state = outcome.state;
                self.in_flight = None;
                self.outcome = Some(outcome.clone());
                self.updated_at = *at;
            }
        }
    }

    /// The step to run next when driving forward.
    pub fn next_step(&self) -> Option<SagaStep> {
        if let Some(step) = self.in_flight {
            return Some(step);
        }
        match self.completed.last() {
            None => Some(SagaStep::Reserve),
            Some(last) => last.next(),
        }
    }

    /// Completed or in-doubt forward steps still awaiting compensation,
    /// newest first.
    pub fn pending_compensations(&self) -> Vec<SagaStep> {
        let mut steps: Vec<SagaStep> = self
            .completed
            .iter()
            .chain(self.uncertain.iter())
            .copied()
            .filter(|s| *s != SagaStep::Commit && !self.compensated.contains(s))
            .collect();
        steps.sort_unstable_by(|a, b| b.cmp(a));
        steps.dedup();
        steps
    }

    /// Snapshot for a caller while the saga is still running.
    pub fn current_outcome(&self) -> CheckoutOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        CheckoutOutcome {
            saga_id: self.id,
            state: self.state,
            order_id: None,
            failure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            idempotency_key: "k".into(),
            user_id: "u".into(),
            sku: "X".into(),
            qty: 1,
            amount: 10,
            payment: PaymentMethod::Gateway {
                method: "card".into(),
            },
            flash_reservation: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn fold_tracks_steps_and_compensation_order() {
        let id = SagaId::generate();
        let mut saga = Saga::open(id, request(), String::new(), Timestamp::zero());
        assert_eq!(saga.next_step(), Some(SagaStep::Reserve));

        for step in [SagaStep::Reserve, SagaStep::Pay] {
            saga.apply(&SagaRecord::StepEntering {
                saga_id: id,
                step,
                planned: StepResults::default(),
                at: Timestamp::new(1),
            });
            assert_eq!(saga.state, step.state());
            saga.apply(&SagaRecord::StepSucceeded {
                saga_id: id,
                step,
                results: StepResults::default(),
                at: Timestamp::new(2),
            });
        }
        saga.apply(&SagaRecord::StepEntering {
            saga_id: id,
            step: SagaStep::Order,
            planned: StepResults::default(),
            at: Timestamp::new(3),
        });
        assert_eq!(saga.next_step(), Some(SagaStep::Order));
        assert!(!saga.state.allows_cancel());

        saga.apply(&SagaRecord::StepFailed {
            saga_id: id,
            step: SagaStep::Order,
            error: "timed out".into(),
            reason: FailureReason::TryAgain,
            in_doubt: true,
            at: Timestamp::new(4),
        });
        assert_eq!(saga.state, SagaState::Compensating);
        assert_eq!(
            saga.pending_compensations(),
            vec![SagaStep::Order, SagaStep::Pay, SagaStep::Reserve]
        );

        saga.apply(&SagaRecord::CompensationDone {
            saga_id: id,
            step: SagaStep::Order,
            at: Timestamp::new(5),
        });
        assert_eq!(
            saga.pending_compensations(),
            vec![SagaStep::Pay, SagaStep::Reserve]
        );
    }

    #[test]
    fn failure_reasons_collapse_detail() {
        assert_eq!(
            FailureReason::classify(&CoreError::InsufficientStock {
                sku: "X".into(),
                requested: 1,
                available: 0
            }),
            FailureReason::SoldOut
        );
        assert_eq!(
            FailureReason::classify(&CoreError::PaymentDeclined {
                reason: "card".into()
            }),
            FailureReason::PaymentDeclined
        );
        assert_eq!(
            FailureReason::classify(&CoreError::deadline("pay")),
            FailureReason::TryAgain
        );
    }

    #[test]
    fn wallet_payment_requires_payee() {
        let mut req = request();
        req.payment = PaymentMethod::Wallet {
            currency: "usd".into(),
            payee_user_id: String::new(),
        };
        assert!(req.validate().is_err());
    }
}
