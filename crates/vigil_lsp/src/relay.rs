//! Admission control between the workspace queue and the workspace worker.
//!
//! Every successful file lint asks for an aggregate-only workspace pass, so an
//! editing burst produces far more of them than the worker can run. Once the
//! relay is half full, further aggregate-only passes are redundant: a pass
//! already queued will run after the file results that triggered them.

use tokio::sync::mpsc;
use tracing::debug;

use crate::ServerError;
use crate::jobs::WorkspaceLintJob;

/// Returns true if `job` should be discarded given `queued` jobs in a relay
/// of `capacity`.
///
/// Only aggregate-only jobs are ever dropped.
pub fn should_drop(job: &WorkspaceLintJob, queued: usize, capacity: usize) -> bool {
    job.aggregate_report_only && queued > capacity / 2
}

/// Outcome of [`Relay::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    Dropped,
}

/// Bounded queue feeding the workspace worker.
#[derive(Debug, Clone)]
pub struct Relay {
    tx: mpsc::Sender<WorkspaceLintJob>,
}

impl Relay {
    /// Creates a relay holding at most `capacity` jobs.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkspaceLintJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Number of jobs waiting in the relay.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Maximum number of jobs the relay holds.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Hands `job` to the workspace worker.
    ///
    /// Aggregate-only jobs never wait: they are dropped when the relay is
    /// busy. Every other job waits for room.
    pub async fn admit(&self, job: WorkspaceLintJob) -> Result<Admission, ServerError> {
        if !job.aggregate_report_only {
            self.tx
                .send(job)
                .await
                .map_err(|_| ServerError::QueueClosed("workspace-relay"))?;
            return Ok(Admission::Queued);
        }

        let queued = self.queued();
        if should_drop(&job, queued, self.capacity()) {
            debug!(
                "Dropping aggregate report job ({}): {} of {} queued",
                job.reason,
                queued,
                self.capacity()
            );
            return Ok(Admission::Dropped);
        }

        match self.tx.try_send(job) {
            Ok(()) => Ok(Admission::Queued),
            Err(mpsc::error::TrySendError::Full(job)) => {
                debug!("Dropping aggregate report job ({}): relay full", job.reason);
                Ok(Admission::Dropped)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ServerError::QueueClosed("workspace-relay"))
            }
        }
    }
}
