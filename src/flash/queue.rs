//! Bounded admission FIFO.
//!
//! One lane per sale: many producers (`attempt_purchase` callers), one
//! dispatcher task draining in arrival order. The dispatcher takes a permit
//! from the shared worker pool for every job, so total concurrency against
//! the reservation ledger is bounded by `admission_workers` regardless of
//! how many sales are live. A full lane rejects immediately with a retry
//! hint; it never blocks the producer.

use crate::core::error::{CoreError, CoreResult};
use crate::core::time::Timestamp;
use crate::ledger::Reservation;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};

/// Retry hint handed out when a lane is full.
pub const QUEUE_FULL_RETRY_AFTER_MS: u64 = 500;

/// A purchase attempt that passed the rate-limit and PoW gates.
#[derive(Debug)]
pub struct AdmissionJob {
    pub user_id: String,
    pub qty: u64,
    pub enqueued_at: Timestamp,
    pub reply: oneshot::Sender<CoreResult<Reservation>>,
}

/// Producer side of one sale's FIFO.
#[derive(Clone)]
pub struct AdmissionLane {
    tx: mpsc::Sender<AdmissionJob>,
    depth: Arc<AtomicU64>,
}

impl AdmissionLane {
    /// Create a lane and spawn its dispatcher.
    pub fn spawn<F, Fut>(
        capacity: usize,
        workers: Arc<Semaphore>,
        mut shutdown: watch::Receiver<bool>,
        handler: F,
    ) -> Self
    where
        F: Fn(AdmissionJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<AdmissionJob>(capacity);
        let depth = Arc::new(AtomicU64::new(0));
        let lane_depth = Arc::clone(&depth);

        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    job = rx.recv() => job,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                };
                let Some(job) = job else { break };
                lane_depth.fetch_sub(1, Ordering::Relaxed);
                if job.reply.is_closed() {
                    // Caller gave up (deadline); skip without touching stock.
                    continue;
                }
                let Ok(_permit) = workers.acquire().await else {
                    break;
                };
                handler(job).await;
            }
            tracing::debug!("admission lane stopped");
        });

        Self { tx, depth }
    }

    /// Enqueue without waiting; a full lane is `rate_limited`.
    pub fn submit(&self, job: AdmissionJob) -> CoreResult<()> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Err(CoreError::RateLimited {
                    retry_after_ms: QUEUE_FULL_RETRY_AFTER_MS,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Err(CoreError::unavailable("admission lane closed"))
            }
        }
    }

    /// Jobs waiting in the lane.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
