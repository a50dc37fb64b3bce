//! Checkout deduplication.
//!
//! Sagas are keyed by the caller's `idempotency_key`. The index maps each key
//! to its saga together with a digest of the request that opened it and,
//! once terminal, the recorded outcome and its digest. The index is never
//! persisted on its own; it is rebuilt from `saga.wal` on replay.

use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::SagaId;
use crate::core::time::Timestamp;
use crate::saga::model::{CheckoutOutcome, CheckoutRequest};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

fn sha256_json<T: Serialize>(value: &T) -> CoreResult<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| CoreError::internal(format!("digest serialization: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Fingerprint of a checkout request; a key reused with a different request
/// is a conflict.
pub fn request_digest(request: &CheckoutRequest) -> CoreResult<String> {
    sha256_json(request)
}

/// Digest stored with a terminal outcome for verification on replay.
pub fn outcome_digest(outcome: &CheckoutOutcome) -> CoreResult<String> {
    sha256_json(outcome)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub saga_id: SagaId,
    pub request_digest: String,
    pub outcome: Option<CheckoutOutcome>,
    pub outcome_digest: Option<String>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// Key never seen; open a saga.
    New,
    /// Saga for this key is still running.
    Running(SagaId),
    /// Saga finished; return this outcome verbatim.
    Completed(CheckoutOutcome),
}

#[derive(Debug, Default)]
pub struct IdempotencyIndex {
    records: HashMap<String, IdempotencyRecord>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&IdempotencyRecord> {
        self.records.get(key)
    }

    /// Look a key up for a new request with `digest`.
    pub fn check(&self, key: &str, digest: &str) -> CoreResult<IdempotencyCheck> {
        let Some(record) = self.records.get(key) else {
            return Ok(IdempotencyCheck::New);
        };
        if record.request_digest != digest {
            return Err(CoreError::conflict(format!(
                "idempotency key {key} was used for a different request"
            )));
        }
        Ok(match &record.outcome {
            Some(outcome) => IdempotencyCheck::Completed(outcome.clone()),
            None => IdempotencyCheck::Running(record.saga_id),
        })
    }

    pub fn open(&mut self, key: &str, saga_id: SagaId, digest: &str, at: Timestamp) -> CoreResult<()> {
        if let Some(existing) = self.records.get(key) {
            return Err(CoreError::conflict(format!(
                "idempotency key {key} already bound to saga {}",
                existing.saga_id
            )));
        }
        self.records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                saga_id,
                request_digest: digest.to_string(),
                outcome: None,
                outcome_digest: None,
                created_at: at,
            },
        );
        Ok(())
    }

    /// Record the terminal outcome. A key closes once; later calls keep the
    /// first outcome.
    pub fn close(&mut self, key: &str, outcome: &CheckoutOutcome, digest: &str) {
        if let Some(record) = self.records.get_mut(key) {
            if record.outcome.is_none() {
                record.outcome = Some(outcome.clone());
                record.outcome_digest = Some(digest.to_string());
            }
        }
    }

    /// Unbind a key whose saga never became durable. Closed keys and keys
    /// rebound to another saga stay.
    pub fn forget(&mut self, key: &str, saga_id: SagaId) {
        if self
            .records
            .get(key)
            .is_some_and(|r| r.saga_id == saga_id && r.outcome.is_none())
        {
            self.records.remove(key);
        }
    }

    pub fn saga_id(&self, key: &str) -> Option<SagaId> {
        self.records.get(key).map(|r| r.saga_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::model::{PaymentMethod, SagaState};
    use std::collections::BTreeMap;

    fn request(qty: u64) -> CheckoutRequest {
        CheckoutRequest {
            idempotency_key: "K".into(),
            user_id: "u".into(),
            sku: "X".into(),
            qty,
            amount: 5,
            payment: PaymentMethod::Gateway {
                method: "card".into(),
            },
            flash_reservation: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn key_moves_from_running_to_completed() {
        let mut index = IdempotencyIndex::new();
        let digest = request_digest(&request(1)).unwrap();
        assert_eq!(index.check("K", &digest).unwrap(), IdempotencyCheck::New);

        let saga_id = SagaId::generate();
        index.open("K", saga_id, &digest, Timestamp::zero()).unwrap();
        assert_eq!(
            index.check("K", &digest).unwrap(),
            IdempotencyCheck::Running(saga_id)
        );

        let outcome = CheckoutOutcome {
            saga_id,
            state: SagaState::Completed,
            order_id: None,
            failure: None,
        };
        index.close("K", &outcome, &outcome_digest(&outcome).unwrap());
        assert_eq!(
            index.check("K", &digest).unwrap(),
            IdempotencyCheck::Completed(outcome)
        );
    }

    #[test]
    fn reused_key_with_other_request_conflicts() {
        let mut index = IdempotencyIndex::new();
        let digest = request_digest(&request(1)).unwrap();
        index
            .open("K", SagaId::generate(), &digest, Timestamp::zero())
            .unwrap();
        let other = request_digest(&request(2)).unwrap();
        assert!(matches!(
            index.check("K", &other),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn forget_unbinds_only_its_own_running_key() {
        let mut index = IdempotencyIndex::new();
        let digest = request_digest(&request(1)).unwrap();
        let first = SagaId::generate();
        index.open("K", first, &digest, Timestamp::zero()).unwrap();

        index.forget("K", SagaId::generate());
        assert_eq!(index.saga_id("K"), Some(first));
        index.forget("K", first);
        assert_eq!(index.check("K", &digest).unwrap(), IdempotencyCheck::New);

        let second = SagaId::generate();
        index.open("K", second, &digest, Timestamp::zero()).unwrap();
        let outcome = CheckoutOutcome {
            saga_id: second,
            state: SagaState::Failed,
            order_id: None,
            failure: None,
        };
        index.close("K", &outcome, &outcome_digest(&outcome).unwrap());
        index.forget("K", second);
        assert_eq!(
            index.check("K", &digest).unwrap(),
            IdempotencyCheck::Completed(outcome)
        );
    }
}
