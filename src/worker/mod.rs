//! Per-egress-path download worker.
//!
//! A [`Worker`] owns two independent gates (parent units and individual file
//! transfers) and drives each task through its attempt cycle:
//!
//! 1. destination already on disk: skipped
//! 2. skip marker present: rejected without retries
//! 3. completion record present: skipped
//! 4. lock held by someone else: yielded, no network I/O
//! 5. transfer under the per-download deadline, retried with backoff
//!
//! Steps 1-4 never leave a failure record: an unreachable store is retried
//! with backoff, anything else ends the cycle. Only transfers count as
//! attempts. A timeout removes the
//! partial file, writes a skip marker and releases the lock, which ends the
//! cycle. If the marker could not be written the next retry reclaims the lock.

mod gate;
mod transfer;


use crate::config::{DownloadConfig, LimitsConfig, RetryConfig, WorkerIdentity};
use crate::coordination::{CompletionRecord, FailureRecord, TaskCoordinator};
use crate::error::DownloadError;
use crate::retry::{IsRetryable, retry_delay};
use crate::types::{
    Event, SkipReason, Task, TaskCounts, TaskKey, TaskOutcome, WorkerId, WorkerStats,
};
use chrono::Utc;
use gate::Gate;
use reqwest::Client;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use transfer::part_path;

/// Everything needed to construct a [`Worker`]
pub struct WorkerParams {
    /// Registration index
    pub id: WorkerId,
    /// Validated egress path
    pub identity: WorkerIdentity,
    /// Holder string written into lock and record values
    pub holder: String,
    /// Pooled client for `identity`
    pub client: Client,
    /// Shared task protocol
    pub coordinator: Arc<TaskCoordinator>,
    /// Transfer settings
    pub download: DownloadConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Gate sizes
    pub limits: LimitsConfig,
    /// Event channel
    pub event_tx: broadcast::Sender<Event>,
}

/// Monotonic task counters, reset only on request
#[derive(Default)]
struct Counters {
    downloaded: AtomicU64,
    skipped: AtomicU64,
    locked_elsewhere: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TaskCounts {
        TaskCounts {
            downloaded: self.downloaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            locked_elsewhere: self.locked_elsewhere.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.downloaded,
            &self.skipped,
            &self.locked_elsewhere,
            &self.failed,
            &self.bytes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Lock and marker state carried across the transfers of one cycle
struct Cycle {
    lock_held: bool,
    skip_marked: bool,
}

/// Result of the pre-transfer checks
enum Claim {
    /// The lock is ours; go ahead and transfer
    Acquired,
    /// Nothing to transfer
    Done(TaskOutcome),
}

/// One egress path with its own gates, client and statistics
pub struct Worker {
    id: WorkerId,
    identity: WorkerIdentity,
    holder: String,
    client: Client,
    coordinator: Arc<TaskCoordinator>,
    download: DownloadConfig,
    retry: RetryConfig,
    post_gate: Gate,
    attachment_gate: Gate,
    counters: Counters,
    event_tx: broadcast::Sender<Event>,
}

impl Worker {
    /// Create a worker from its parameters
    pub fn new(params: WorkerParams) -> Self {
        Self {
            id: params.id,
            identity: params.identity,
            holder: params.holder,
            client: params.client,
            coordinator: params.coordinator,
            download: params.download,
            retry: params.retry,
            post_gate: Gate::new(params.limits.post_limit),
            attachment_gate: Gate::new(params.limits.attachment_limit),
            counters: Counters::default(),
            event_tx: params.event_tx,
        }
    }

    /// Registration index
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Egress path
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Holder string this worker writes into the store
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Combined pending units across both gates
    pub fn pending(&self) -> usize {
        self.post_gate.pending() + self.attachment_gate.pending()
    }

    /// Run `fut` while holding one of this worker's parent-unit slots
    pub async fn with_post_slot<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        let _slot = self.post_gate.enter().await;
        fut.await
    }

    /// Download one task through this worker's egress path
    ///
    /// Waits for a transfer slot first. Benign results (already present,
    /// already completed, locked elsewhere) are `Ok`; everything else is an
    /// error after the attempt cycle ended.
    pub async fn download(&self, task: &Task) -> Result<TaskOutcome, DownloadError> {
        let _slot = self.attachment_gate.enter().await;
        let key = TaskCoordinator::derive_key(task);

        let result = self.run_cycle(task, &key).await;
        self.record(&key, &result);
        result
    }

    /// Current statistics
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker: self.id,
            identity: self.identity.to_string(),
            counts: self.counters.snapshot(),
            pending_posts: self.post_gate.pending(),
            pending_attachments: self.attachment_gate.pending(),
        }
    }

    /// Zero the task counters; pending depth is live and unaffected
    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    async fn run_cycle(&self, task: &Task, key: &TaskKey) -> Result<TaskOutcome, DownloadError> {
        // Claim failures back off without counting as attempts or leaving a
        // failure record: nothing was transferred and the lock was never ours
        let mut claims = 0u32;
        let claim = loop {
            match self.claim(task, key).await {
                Err(e) if e.is_retryable() && claims < self.retry.max_retries => {
                    claims += 1;
                    self.back_off(task, key, claims, &e).await;
                }
                result => break result?,
            }
        };
        if let Claim::Done(outcome) = claim {
            return Ok(outcome);
        }

        let mut cycle = Cycle {
            lock_held: true,
            skip_marked: false,
        };
        let mut transfers = 0u32;
        let mut last_failure: Option<DownloadError> = None;

        loop {
            if !cycle.lock_held {
                match self.claim(task, key).await {
                    Ok(Claim::Acquired) => cycle.lock_held = true,
                    Ok(Claim::Done(outcome)) => return Ok(outcome),
                    Err(e) => {
                        tracing::warn!(worker = %self.id, task_key = %key, error = %e, "Could not reclaim task for retry");
                        let last = last_failure.take().unwrap_or(e);
                        return Err(exhausted(transfers, last));
                    }
                }
            }

            transfers += 1;
            let error = match self.attempt(task, key, transfers, &mut cycle).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };

            // The skip marker rejects any further attempt on this destination
            if cycle.skip_marked {
                return Err(self.give_up(key, transfers, error, cycle.lock_held).await);
            }

            if error.is_retryable() && transfers <= self.retry.max_retries {
                self.back_off(task, key, transfers, &error).await;
                last_failure = Some(error);
                continue;
            }

            return Err(self.give_up(key, transfers, error, cycle.lock_held).await);
        }
    }

    /// Announce retry number `retry` and sleep its backoff delay
    async fn back_off(&self, task: &Task, key: &TaskKey, retry: u32, error: &DownloadError) {
        let delay = retry_delay(&self.retry, retry);
        tracing::warn!(
            worker = %self.id,
            task_key = %key,
            url = %task.url,
            retry,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Download attempt failed, retrying"
        );
        self.event_tx
            .send(Event::TaskRetrying {
                key: key.clone(),
                worker: self.id,
                retry,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            })
            .ok();
        tokio::time::sleep(delay).await;
    }

    /// One transfer under the lock held in `cycle`
    async fn attempt(
        &self,
        task: &Task,
        key: &TaskKey,
        attempt: u32,
        cycle: &mut Cycle,
    ) -> Result<TaskOutcome, DownloadError> {
        if let Err(e) = self.coordinator.mark_in_progress(key, &self.holder).await {
            tracing::warn!(worker = %self.id, task_key = %key, error = %e, "Failed to write in-progress marker");
        }

        let part = part_path(&task.destination);
        let fetch =
            transfer::fetch_to_file(&self.client, &task.url, &part, self.download.max_redirects);

        match tokio::time::timeout(self.download.timeout, fetch).await {
            Ok(Ok(transferred)) => {
                if let Err(e) = tokio::fs::rename(&part, &task.destination).await {
                    transfer::remove_partial(&part).await;
                    return Err(e.into());
                }
                self.finish(task, key, cycle, transferred.bytes, &transferred.final_url)
                    .await;
                Ok(TaskOutcome::Downloaded {
                    bytes: transferred.bytes,
                    attempts: attempt,
                    final_url: transferred.final_url,
                })
            }
            Ok(Err(e)) => {
                transfer::remove_partial(&part).await;
                Err(e)
            }
            Err(_) => {
                self.abandon_timed_out(key, &part, cycle).await;
                Err(DownloadError::Timeout {
                    after: self.download.timeout,
                })
            }
        }
    }

    /// Pre-transfer checks and lock acquisition
    ///
    /// Any store failure surfaces as an error: without a confirmed lock the
    /// worker never touches the network.
    async fn claim(&self, task: &Task, key: &TaskKey) -> Result<Claim, DownloadError> {
        let present = tokio::fs::try_exists(&task.destination)
            .await
            .map_err(DownloadError::DestinationCheck)?;
        if present {
            tracing::debug!(worker = %self.id, task_key = %key, path = %task.destination.display(), "Destination already exists");
            return Ok(Claim::Done(TaskOutcome::Skipped {
                reason: SkipReason::AlreadyExists,
            }));
        }

        if self.coordinator.is_skip_marked(key).await? {
            tracing::debug!(worker = %self.id, task_key = %key, "Destination is skip-marked");
            return Err(DownloadError::SkipMarked);
        }

        if self.coordinator.is_completed(key).await? {
            return Ok(Claim::Done(TaskOutcome::Skipped {
                reason: SkipReason::AlreadyCompleted,
            }));
        }

        if !self.coordinator.acquire_lock(key, &self.holder).await? {
            let holder = self.coordinator.get_lock_holder(key).await.ok().flatten();
            tracing::debug!(worker = %self.id, task_key = %key, holder = ?holder, "Task locked elsewhere");
            return Ok(Claim::Done(TaskOutcome::LockedElsewhere { holder }));
        }

        // A holder may have completed and released between the check and the acquire
        if self.coordinator.is_completed(key).await? {
            self.release(key).await;
            return Ok(Claim::Done(TaskOutcome::Skipped {
                reason: SkipReason::AlreadyCompleted,
            }));
        }

        self.event_tx
            .send(Event::TaskStarted {
                key: key.clone(),
                worker: self.id,
            })
            .ok();
        Ok(Claim::Acquired)
    }

    /// Write the completion record; the coordinator clears lock and marker
    async fn finish(&self, task: &Task, key: &TaskKey, cycle: &mut Cycle, bytes: u64, url: &str) {
        let record = CompletionRecord {
            holder: self.holder.clone(),
            url: url.to_string(),
            destination: task.destination.clone(),
            size_bytes: bytes,
            completed_at: Utc::now(),
        };
        match self.coordinator.mark_completed(key, &record).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(worker = %self.id, task_key = %key, "Completion record already existed")
            }
            Err(e) => {
                tracing::warn!(worker = %self.id, task_key = %key, error = %e, "Failed to write completion record");
                self.release(key).await;
            }
        }
        cycle.lock_held = false;
        tracing::info!(worker = %self.id, task_key = %key, url, bytes, "Download complete");
    }

    async fn abandon_timed_out(&self, key: &TaskKey, part: &Path, cycle: &mut Cycle) {
        transfer::remove_partial(part).await;

        match self.coordinator.set_skip_marker(key, "timeout").await {
            Ok(()) => cycle.skip_marked = true,
            Err(e) => {
                tracing::warn!(worker = %self.id, task_key = %key, error = %e, "Failed to write skip marker")
            }
        }
        match self.coordinator.release_lock(key, &self.holder).await {
            Ok(_) => cycle.lock_held = false,
            Err(e) => {
                tracing::warn!(worker = %self.id, task_key = %key, error = %e, "Failed to release lock after timeout")
            }
        }
    }

    /// Record the terminal failure and release the lock
    async fn give_up(
        &self,
        key: &TaskKey,
        attempts: u32,
        last: DownloadError,
        lock_held: bool,
    ) -> DownloadError {
        let error = exhausted(attempts, last);
        let record = FailureRecord {
            holder: self.holder.clone(),
            error: error.to_string(),
            code: error.code().to_string(),
            attempts,
            failed_at: Utc::now(),
        };
        if let Err(e) = self.coordinator.mark_failed(key, &record).await {
            tracing::warn!(worker = %self.id, task_key = %key, error = %e, "Failed to write failure record");
        }
        if lock_held {
            self.release(key).await;
        }
        error
    }

    async fn release(&self, key: &TaskKey) {
        if let Err(e) = self.coordinator.release_lock(key, &self.holder).await {
            tracing::warn!(worker = %self.id, task_key = %key, error = %e, "Failed to release lock");
        }
    }

    fn record(&self, key: &TaskKey, result: &Result<TaskOutcome, DownloadError>) {
        let key = key.clone();
        let worker = self.id;
        let event = match result {
            Ok(TaskOutcome::Downloaded { bytes, .. }) => {
                self.counters.downloaded.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes.fetch_add(*bytes, Ordering::Relaxed);
                Event::TaskCompleted {
                    key,
                    worker,
                    bytes: *bytes,
                }
            }
            Ok(TaskOutcome::Skipped { reason }) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                Event::TaskSkipped {
                    key,
                    worker,
                    reason: *reason,
                }
            }
            Ok(TaskOutcome::LockedElsewhere { .. }) => {
                self.counters.locked_elsewhere.fetch_add(1, Ordering::Relaxed);
                Event::TaskLockedElsewhere { key, worker }
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = %worker, task_key = %key, error = %e, "Download failed");
                Event::TaskFailed {
                    key,
                    worker,
                    error: e.to_string(),
                }
            }
        };
        self.event_tx.send(event).ok();
    }
}


fn exhausted(attempts: u32, last: DownloadError) -> DownloadError {
    DownloadError::RetriesExhausted {
        attempts,
        last: Box::new(last),
    }
}
