//! Upload bookkeeping shared between the caller and the upload worker.
//!
//! Counters live in a `watch` channel so readers get a consistent copy and
//! `finish()` can wait for `pending` to reach zero without polling. Every
//! counter update happens inside one `send_modify`, which keeps
//! `total == successful + failed + pending` true at every observable instant.
//!
//! The ledger also owns every job that is still pending, keyed by its
//! idempotency key. A result only counts if the ledger still owns the job,
//! so results for jobs that were abandoned at shutdown or belong to a run
//! that has since been reset are dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use uuid::Uuid;

use crate::types::UploadJob;

/// Counters for the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Enqueued but not yet finished (queued or in flight).
    pub pending: u64,
}

impl UploadStats {
    pub fn is_consistent(&self) -> bool {
        self.total == self.successful + self.failed + self.pending
    }
}

/// A job that reached the failed state, kept for inspection and manual retry.
#[derive(Debug, Clone)]
pub struct FailedUpload {
    pub job: UploadJob,
    pub error: String,
    pub status: Option<u16>,
    pub attempts: u32,
    pub failed_at: DateTime<Local>,
}

impl FailedUpload {
    pub fn new(job: UploadJob, error: impl Into<String>, status: Option<u16>, attempts: u32) -> Self {
        Self {
            job,
            error: error.into(),
            status,
            attempts,
            failed_at: Local::now(),
        }
    }

    /// The serializable view written to the failed-uploads file.
    pub fn to_record(&self) -> FailedUploadRecord {
        FailedUploadRecord {
            measurement_data: FailedMeasurementData {
                mask_id: self.job.mask_id,
                run_name: self.job.run_name.clone(),
                device_name: self.job.device_name.clone(),
                test_meta: self.job.test_meta.clone(),
                timestamp: self.job.timestamp.clone(),
                idempotency_key: self.job.idempotency_key,
            },
            error: self.error.clone(),
            status: self.status,
            attempts: self.attempts,
            timestamp: self.failed_at.to_rfc3339(),
        }
    }
}

/// One entry of a persisted failed-uploads file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUploadRecord {
    pub measurement_data: FailedMeasurementData,
    pub error: String,
    pub status: Option<u16>,
    pub attempts: u32,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMeasurementData {
    pub mask_id: i64,
    pub run_name: String,
    pub device_name: String,
    pub test_meta: Map<String, Value>,
    pub timestamp: Option<String>,
    pub idempotency_key: Uuid,
}

#[derive(Default)]
struct JobBook {
    outstanding: Vec<UploadJob>,
    failed: Vec<FailedUpload>,
}

impl JobBook {
    fn claim(&mut self, key: Uuid) -> Option<UploadJob> {
        let index = self
            .outstanding
            .iter()
            .position(|job| job.idempotency_key == key)?;
        Some(self.outstanding.remove(index))
    }
}

/// Shared statistics and failed-upload list. Cloning shares state.
#[derive(Clone)]
pub struct UploadLedger {
    stats: Arc<watch::Sender<UploadStats>>,
    book: Arc<Mutex<JobBook>>,
}

impl Default for UploadLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadLedger {
    pub fn new() -> Self {
        let (stats, _) = watch::channel(UploadStats::default());
        Self {
            stats: Arc::new(stats),
            book: Arc::new(Mutex::new(JobBook::default())),
        }
    }

    fn book(&self) -> MutexGuard<'_, JobBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A consistent copy of the counters.
    pub fn snapshot(&self) -> UploadStats {
        *self.stats.borrow()
    }

    /// Take ownership of a job about to be queued.
    pub fn record_enqueued(&self, job: &UploadJob) {
        let mut book = self.book();
        book.outstanding.push(job.clone());
        self.stats.send_modify(|s| {
            s.total += 1;
            s.pending += 1;
        });
    }

    /// Mark the job with `key` uploaded. Returns false if the ledger no
    /// longer owns it.
    pub fn record_success(&self, key: Uuid) -> bool {
        let mut book = self.book();
        if book.claim(key).is_none() {
            return false;
        }
        self.stats.send_modify(|s| {
            s.pending -= 1;
            s.successful += 1;
        });
        true
    }

    /// Mark a job failed. Returns false if the ledger no longer owns it.
    pub fn record_failure(&self, failure: FailedUpload) -> bool {
        let mut book = self.book();
        if book.claim(failure.job.idempotency_key).is_none() {
            return false;
        }
        book.failed.push(failure);
        self.stats.send_modify(|s| {
            s.pending -= 1;
            s.failed += 1;
        });
        true
    }

    /// Fail every job that is still pending, queued or in flight, with
    /// `error`. Later results for those jobs are ignored.
    pub fn abandon_pending(&self, error: &str) -> usize {
        let mut book = self.book();
        let abandoned = std::mem::take(&mut book.outstanding);
        let count = abandoned.len();
        book.failed.extend(
            abandoned
                .into_iter()
                .map(|job| FailedUpload::new(job, error, None, 0)),
        );
        self.stats.send_modify(|s| {
            s.pending -= count as u64;
            s.failed += count as u64;
        });
        count
    }

    /// Move `count` previously failed jobs to the successful column.
    pub fn record_recovered(&self, count: u64) {
        self.stats.send_modify(|s| {
            let moved = count.min(s.failed);
            s.failed -= moved;
            s.successful += moved;
        });
    }

    pub fn failed_uploads(&self) -> Vec<FailedUpload> {
        self.book().failed.clone()
    }

    pub fn failed_count(&self) -> usize {
        self.book().failed.len()
    }

    /// Remove and return every failed upload.
    pub fn take_failed(&self) -> Vec<FailedUpload> {
        std::mem::take(&mut self.book().failed)
    }

    /// Put failures back ahead of any recorded since they were taken.
    pub fn restore_failed(&self, mut remaining: Vec<FailedUpload>) {
        let mut book = self.book();
        remaining.append(&mut book.failed);
        book.failed = remaining;
    }

    /// Clear counters, pending jobs and the failed list for a new run.
    pub fn reset(&self) {
        let mut book = self.book();
        book.outstanding.clear();
        book.failed.clear();
        self.stats.send_replace(UploadStats::default());
    }

    /// Wait until every enqueued job has reached a terminal state.
    pub async fn wait_until_drained(&self) {
        let mut rx = self.stats.subscribe();
        // The sender lives as long as `self`, so this only returns once drained.
        let _ = rx.wait_for(|s| s.pending == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiePosition, Measurement, RawDataFile, RunConfig};
    use proptest::prelude::*;
    use std::time::Duration;

    fn job(device: &str) -> UploadJob {
        let run = RunConfig::new(1, "R1");
        let measurement = Measurement::new(device, 1.0, 1.0, 1.0);
        UploadJob::new(&run, &measurement, DiePosition::default(), RawDataFile::Missing)
    }

    fn failure_of(job: UploadJob) -> FailedUpload {
        FailedUpload::new(job, "HTTP 404", Some(404), 1)
    }

    fn enqueued(ledger: &UploadLedger, device: &str) -> UploadJob {
        let job = job(device);
        ledger.record_enqueued(&job);
        job
    }

    #[test]
    fn test_counters() {
        let ledger = UploadLedger::new();
        let first = enqueued(&ledger, "L1");
        let second = enqueued(&ledger, "L2");
        enqueued(&ledger, "L3");
        assert!(ledger.record_success(first.idempotency_key));
        assert!(ledger.record_failure(failure_of(second)));

        let stats = ledger.snapshot();
        assert_eq!(
            stats,
            UploadStats {
                total: 3,
                successful: 1,
                failed: 1,
                pending: 1
            }
        );
        assert!(stats.is_consistent());
        assert_eq!(ledger.failed_count(), 1);
    }

    #[test]
    fn test_results_count_once() {
        let ledger = UploadLedger::new();
        let job = enqueued(&ledger, "L1");

        assert!(ledger.record_success(job.idempotency_key));
        assert!(!ledger.record_success(job.idempotency_key));
        assert!(!ledger.record_failure(failure_of(job)));

        assert_eq!(ledger.snapshot().successful, 1);
        assert_eq!(ledger.failed_count(), 0);
    }

    #[test]
    fn test_abandon_pending_fails_outstanding_jobs() {
        let ledger = UploadLedger::new();
        let done = enqueued(&ledger, "L1");
        let in_flight = enqueued(&ledger, "L2");
        enqueued(&ledger, "L3");
        ledger.record_success(done.idempotency_key);

        assert_eq!(ledger.abandon_pending("abandoned"), 2);

        let stats = ledger.snapshot();
        assert_eq!((stats.successful, stats.failed, stats.pending), (1, 2, 0));
        let devices: Vec<String> = ledger
            .failed_uploads()
            .into_iter()
            .map(|f| f.job.device_name)
            .collect();
        assert_eq!(devices, vec!["L2", "L3"]);

        // The worker finishing the abandoned job later changes nothing.
        assert!(!ledger.record_failure(failure_of(in_flight)));
        assert_eq!(ledger.failed_count(), 2);
        assert_eq!(ledger.snapshot().failed, 2);
    }

    #[test]
    fn test_results_from_before_reset_are_ignored() {
        let ledger = UploadLedger::new();
        let stale_ok = enqueued(&ledger, "old-1");
        let stale_err = enqueued(&ledger, "old-2");
        ledger.reset();

        let current = enqueued(&ledger, "new");
        assert!(!ledger.record_success(stale_ok.idempotency_key));
        assert!(!ledger.record_failure(failure_of(stale_err)));

        let stats = ledger.snapshot();
        assert_eq!((stats.total, stats.pending, stats.failed), (1, 1, 0));
        assert_eq!(ledger.failed_count(), 0);
        assert!(ledger.record_success(current.idempotency_key));
    }

    #[test]
    fn test_take_and_restore_keeps_order() {
        let ledger = UploadLedger::new();
        for device in ["A", "B"] {
            let job = enqueued(&ledger, device);
            ledger.record_failure(failure_of(job));
        }

        let taken = ledger.take_failed();
        assert_eq!(ledger.failed_count(), 0);

        let job = enqueued(&ledger, "C");
        ledger.record_failure(failure_of(job));
        ledger.restore_failed(taken);

        let devices: Vec<String> = ledger
            .failed_uploads()
            .into_iter()
            .map(|f| f.job.device_name)
            .collect();
        assert_eq!(devices, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_recovered_and_reset() {
        let ledger = UploadLedger::new();
        let job = enqueued(&ledger, "L1");
        ledger.record_failure(failure_of(job));
        ledger.record_recovered(5);

        let stats = ledger.snapshot();
        assert_eq!((stats.successful, stats.failed), (1, 0));
        assert!(stats.is_consistent());

        ledger.reset();
        assert_eq!(ledger.snapshot(), UploadStats::default());
        assert_eq!(ledger.failed_count(), 0);
    }

    #[test]
    fn test_failed_record_shape() {
        let record = failure_of(job("L7")).to_record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["measurement_data"]["device_name"], "L7");
        assert_eq!(json["measurement_data"]["run_name"], "R1");
        assert_eq!(json["status"], 404);
        assert_eq!(json["error"], "HTTP 404");
    }

    #[tokio::test]
    async fn test_wait_until_drained() {
        let ledger = UploadLedger::new();
        ledger.wait_until_drained().await;

        let first = enqueued(&ledger, "L1");
        let second = enqueued(&ledger, "L2");

        let worker = ledger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.record_success(first.idempotency_key);
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.record_failure(failure_of(second));
        });

        tokio::time::timeout(Duration::from_secs(5), ledger.wait_until_drained())
            .await
            .expect("ledger should drain");
        assert_eq!(ledger.snapshot().pending, 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue,
        Succeed,
        Fail,
        Stale,
        Retry(usize),
        Abandon,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Enqueue),
            2 => Just(Op::Succeed),
            2 => Just(Op::Fail),
            1 => Just(Op::Stale),
            1 => (0usize..4).prop_map(Op::Retry),
            1 => Just(Op::Abandon),
        ]
    }

    proptest! {
        #[test]
        fn prop_totals_always_balance(ops in prop::collection::vec(op_strategy(), 0..200)) {
            let ledger = UploadLedger::new();
            let mut queued: Vec<UploadJob> = Vec::new();
            for op in ops {
                match op {
                    Op::Enqueue => queued.push(enqueued(&ledger, "P")),
                    Op::Succeed => {
                        if !queued.is_empty() {
                            let job = queued.remove(0);
                            ledger.record_success(job.idempotency_key);
                        }
                    }
                    Op::Fail => {
                        if !queued.is_empty() {
                            let job = queued.remove(0);
                            ledger.record_failure(failure_of(job));
                        }
                    }
                    Op::Stale => {
                        prop_assert!(!ledger.record_failure(failure_of(job("stale"))));
                    }
                    Op::Retry(recovered) => {
                        let mut failures = ledger.take_failed();
                        let recovered = recovered.min(failures.len());
                        let remaining = failures.split_off(recovered);
                        ledger.record_recovered(recovered as u64);
                        ledger.restore_failed(remaining);
                    }
                    Op::Abandon => {
                        ledger.abandon_pending("abandoned");
                    }
                }
                let stats = ledger.snapshot();
                prop_assert!(stats.is_consistent());
                prop_assert_eq!(stats.failed, ledger.failed_count() as u64);
            }
        }
    }
}
