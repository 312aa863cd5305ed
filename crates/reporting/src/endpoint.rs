//! Boundary for the unauthenticated report-ingestion endpoint.
//!
//! Violations are recorded before the request returns. Promotion involves an
//! allow-list fetch, so it runs on a background worker fed by a bounded queue.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::ingest::{Violation, ViolationIngestor};
use crate::reconciler::AllowListReconciler;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Counts of what one request did. The request itself always succeeds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportReceipt {
    pub accepted: usize,
    pub queued: usize,
    pub failed: usize,
}

enum PromotionJob {
    Promote(Violation),
    Flush(oneshot::Sender<()>),
}

/// Receives violation report bodies from browsers.
pub struct ReportEndpoint {
    ingestor: ViolationIngestor,
    reconciler: Arc<AllowListReconciler>,
    queue_capacity: usize,
    worker: Mutex<Option<mpsc::Sender<PromotionJob>>>,
}

impl ReportEndpoint {
    pub fn new(reconciler: Arc<AllowListReconciler>) -> Self {
        Self {
            ingestor: ViolationIngestor::new(),
            reconciler,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker: Mutex::new(None),
        }
    }

    /// Bound the number of violations waiting for promotion. Excess ones are
    /// recorded but not promoted.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Handle one POST body.
    ///
    /// Never returns an error: failures are logged and counted so the sender
    /// always sees success and never retries.
    pub async fn handle(&self, content_type: Option<&str>, body: &[u8]) -> ReportReceipt {
        let mut receipt = ReportReceipt::default();
        let mut queue = None;

        for violation in self.ingestor.ingest(content_type, body) {
            receipt.accepted += 1;
            if let Err(e) = self.reconciler.record(&violation).await {
                receipt.failed += 1;
                error!(
                    source = %violation.source,
                    directive = %violation.directive,
                    "Failed to record violation report: {}", e
                );
                continue;
            }

            let queue = queue.get_or_insert_with(|| self.worker());
            match queue.try_send(PromotionJob::Promote(violation)) {
                Ok(()) => receipt.queued += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    warn!("Promotion queue is full, violation recorded without promotion");
                }
            }
        }

        if receipt.accepted > 0 {
            info!(
                accepted = receipt.accepted,
                queued = receipt.queued,
                failed = receipt.failed,
                "Processed violation reports"
            );
        }
        receipt
    }

    /// Wait until every promotion queued before this call has finished.
    pub async fn drain(&self) {
        let Some(queue) = self.worker.lock().clone() else {
            return;
        };
        let (done, finished) = oneshot::channel();
        if queue.send(PromotionJob::Flush(done)).await.is_ok() {
            finished.await.ok();
        }
    }

    // Started on first use; stops once the endpoint is dropped.
    fn worker(&self) -> mpsc::Sender<PromotionJob> {
        let mut worker = self.worker.lock();
        if let Some(queue) = worker.as_ref().filter(|q| !q.is_closed()) {
            return queue.clone();
        }

        let (queue, jobs) = mpsc::channel(self.queue_capacity);
        tokio::spawn(run_promotions(self.reconciler.clone(), jobs));
        *worker = Some(queue.clone());
        queue
    }
}

async fn run_promotions(reconciler: Arc<AllowListReconciler>, mut jobs: mpsc::Receiver<PromotionJob>) {
    while let Some(job) = jobs.recv().await {
        match job {
            PromotionJob::Promote(violation) => {
                if let Err(e) = reconciler.promote(&violation).await {
                    error!(
                        source = %violation.source,
                        directive = %violation.directive,
                        "Failed to promote violation: {}", e
                    );
                }
            }
            PromotionJob::Flush(done) => {
                done.send(()).ok();
            }
        }
    }
    debug!("Promotion worker stopped");
}
