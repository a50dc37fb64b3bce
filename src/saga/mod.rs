//! Checkout saga orchestration (C4).
//!
//! reserve → pay → order → commit, each forward step paired with a
//! compensation, journaled in `saga.wal` and deduplicated per
//! idempotency key.

pub mod collaborators;
pub mod idempotency;
pub mod journal;
pub mod model;
pub mod orchestrator;

pub use collaborators::{
    InMemoryOrderStore, LocalPaymentGateway, NewOrder, OrderRecord, OrderStatus, OrderStore,
    PaymentGateway,
};
pub use model::{
    CheckoutOutcome, CheckoutRequest, FailureReason, PaymentMethod, Saga, SagaRecord, SagaState,
    SagaStep, StepResults,
};
pub use orchestrator::{SagaDeps, SagaOrchestrator};
