use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::types::UploadJob;

/// Producer half of the unbounded FIFO upload queue.
///
/// Enqueueing never blocks and never applies backpressure.
#[derive(Clone)]
pub struct UploadQueue {
    tx: mpsc::UnboundedSender<UploadJob>,
    depth: Arc<AtomicUsize>,
}

/// Consumer half, owned by the single upload worker.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<UploadJob>,
    depth: Arc<AtomicUsize>,
}

/// Why a dequeue returned without a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueError {
    Timeout,
    /// Every producer has been dropped and the queue is empty.
    Closed,
}

impl UploadQueue {
    pub fn channel() -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: Arc::clone(&depth),
            },
            QueueReceiver { rx, depth },
        )
    }

    /// Append a job. Hands the job back if the consumer is gone.
    pub fn enqueue(&self, job: UploadJob) -> Result<(), UploadJob> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|e| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }

    /// Number of jobs waiting to be picked up (excludes the one in flight).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl QueueReceiver {
    /// Wait up to `timeout` for the next job.
    pub async fn dequeue_timeout(&mut self, timeout: Duration) -> Result<UploadJob, DequeueError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(job)) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Ok(job)
            }
            Ok(None) => Err(DequeueError::Closed),
            Err(_) => Err(DequeueError::Timeout),
        }
    }

    /// Take a job if one is immediately available.
    pub fn try_dequeue(&mut self) -> Option<UploadJob> {
        let job = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }

    /// Stop accepting new jobs; already queued jobs can still be dequeued.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
