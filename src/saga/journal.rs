//! Durable saga log over `saga.wal`.

use crate::core::error::CoreResult;
use crate::core::ids::SagaId;
use crate::saga::idempotency::outcome_digest;
use crate::saga::model::{Saga, SagaRecord};
use crate::storage::Journal;
use std::collections::BTreeMap;

pub struct SagaLog {
    journal: Journal<SagaRecord>,
}

impl SagaLog {
    pub fn new(journal: Journal<SagaRecord>) -> Self {
        Self { journal }
    }

    pub fn len(&self) -> u64 {
        self.journal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.journal.is_empty()
    }

    /// Append `record` and fold it into `saga`.
    pub fn append(&self, saga: &mut Saga, record: SagaRecord) -> CoreResult<()> {
        self.journal.append(&record)?;
        saga.apply(&record);
        Ok(())
    }

    /// Rebuild every saga from the log, ordered by id.
    ///
    /// A closed saga whose stored digest does not match its outcome is
    /// flagged for attention rather than trusted.
    pub fn replay(&self) -> CoreResult<BTreeMap<SagaId, Saga>> {
        let mut sagas: BTreeMap<SagaId, Saga> = BTreeMap::new();
        let mut orphans = 0usize;
        for entry in self.journal.replay()? {
            let record = entry.record;
            if let SagaRecord::Opened {
                saga_id,
                request,
                request_digest,
                at,
            } = &record
            {
                sagas.insert(
                    *saga_id,
                    Saga::open(*saga_id, request.clone(), request_digest.clone(), *at),
                );
                continue;
            }
            let Some(saga) = sagas.get_mut(&record.saga_id()) else {
                orphans += 1;
                continue;
            };
            saga.apply(&record);
            if let SagaRecord::Closed {
                saga_id,
                outcome,
                digest,
                ..
            } = &record
            {
                if outcome_digest(outcome)? != *digest {
                    tracing::error!(saga_id = %saga_id, "recorded outcome digest mismatch");
                    saga.needs_attention = true;
                }
            }
        }
        if orphans > 0 {
            tracing::warn!(orphans, "saga records without an opening record skipped");
        }
        tracing::info!(
            records = self.journal.len(),
            sagas = sagas.len(),
            "saga log replayed"
        );
        Ok(sagas)
    }
}
