//! Worker selection, health tracking and batch processing.
//!
//! The [`Orchestrator`] is an explicitly constructed, caller-owned handle.
//! Its lifecycle is `new` (validate descriptors, build workers) → `submit` /
//! `submit_batch` → `shutdown`.

mod health;
mod strategy;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::coordination::{CoordinationStore, TaskCoordinator};
use crate::error::{DownloadError, Error, Result};
use crate::pool::ClientPoolFactory;
use crate::types::{
    BatchStats, Event, HealthStatus, OrchestratorStats, Task, TaskCounts, TaskOutcome, UnitStats,
    WorkerHealthSnapshot, WorkerId,
};
use crate::worker::{Worker, WorkerParams};
use futures::StreamExt;
use health::{HealthTracker, Transition};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strategy::Selector;
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers lag rather than block
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Owns the workers, their health and the distribution strategy
pub struct Orchestrator {
    config: Config,
    coordinator: Arc<TaskCoordinator>,
    pools: ClientPoolFactory,
    workers: Vec<Worker>,
    health: HealthTracker,
    selector: Selector,
    event_tx: broadcast::Sender<Event>,
    accepting: AtomicBool,
    instance_id: String,
}

impl Orchestrator {
    /// Validate the configuration and build one worker per valid descriptor
    ///
    /// Invalid descriptors are logged and skipped. Fails with
    /// [`Error::NoWorkers`] if none remain.
    pub fn new(config: Config, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        config.validate()?;

        let instance_id = config
            .coordination
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));
        let coordinator = Arc::new(TaskCoordinator::new(
            store,
            config.coordination.clone(),
            config.download.skip_cache_ttl,
        ));
        let pools = ClientPoolFactory::new(config.pool.clone(), &config.download);
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut workers = Vec::with_capacity(config.workers.len());
        for (index, descriptor) in config.workers.iter().enumerate() {
            let identity = match descriptor.validate() {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!(index, error = %e, "Skipping invalid worker descriptor");
                    continue;
                }
            };
            let client = match pools.get_pool(&identity) {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(index, worker = %identity, error = %e, "Skipping worker without a usable client");
                    continue;
                }
            };

            let id = WorkerId(workers.len());
            workers.push(Worker::new(WorkerParams {
                id,
                holder: format!("{instance_id}/{id}/{identity}"),
                identity,
                client,
                coordinator: Arc::clone(&coordinator),
                download: config.download.clone(),
                retry: config.retry.clone(),
                limits: config.limits.clone(),
                event_tx: event_tx.clone(),
            }));
        }

        if workers.is_empty() {
            return Err(Error::NoWorkers);
        }

        tracing::info!(
            instance = %instance_id,
            workers = workers.len(),
            strategy = ?config.strategy,
            "Orchestrator initialized"
        );

        Ok(Self {
            health: HealthTracker::new(config.health.clone(), workers.len()),
            selector: Selector::new(config.strategy),
            config,
            coordinator,
            pools,
            workers,
            event_tx,
            accepting: AtomicBool::new(true),
            instance_id,
        })
    }

    /// Subscribe to task and health events
    ///
    /// Events sent before subscribing are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The task protocol shared by every worker
    pub fn coordinator(&self) -> &Arc<TaskCoordinator> {
        &self.coordinator
    }

    /// Registered workers in registration order
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Prefix of every holder string written by this instance
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Pick a worker for the next task
    ///
    /// Only healthy workers are candidates unless none is, in which case every
    /// worker is. Recovery is checked for all workers first.
    pub fn select_worker(&self) -> Option<&Worker> {
        for index in 0..self.workers.len() {
            self.recover(index);
        }

        let healthy: Vec<usize> = (0..self.workers.len())
            .filter(|&i| self.health.status(i) == Some(HealthStatus::Healthy))
            .collect();
        let candidates = if healthy.is_empty() {
            tracing::debug!("No healthy workers, selecting among all workers");
            (0..self.workers.len()).collect()
        } else {
            healthy
        };

        let loads: Vec<usize> = candidates
            .iter()
            .map(|&i| self.workers[i].pending())
            .collect();
        let pick = self.selector.pick(&loads)?;
        candidates.get(pick).map(|&i| &self.workers[i])
    }

    /// Count a failure against `worker`
    pub fn record_failure(&self, worker: WorkerId, error: &DownloadError) {
        tracing::debug!(worker = %worker, error = %error, "Recording worker failure");
        if let Some(transition) = self.health.record_failure(worker.0) {
            self.announce(worker, transition);
        }
    }

    /// End `worker`'s failure streak
    pub fn record_success(&self, worker: WorkerId) {
        if let Some(transition) = self.health.record_success(worker.0) {
            self.announce(worker, transition);
        }
    }

    /// Reset `worker` to healthy if the cooldown has passed since its last failure
    ///
    /// Returns the status after the check.
    pub fn attempt_recovery(&self, worker: WorkerId) -> Option<HealthStatus> {
        self.recover(worker.0);
        self.health.status(worker.0)
    }

    fn recover(&self, index: usize) {
        if let Some(transition) = self.health.attempt_recovery(index) {
            self.announce(WorkerId(index), transition);
        }
    }

    fn announce(&self, worker: WorkerId, transition: Transition) {
        let Transition { from, to } = transition;
        match to {
            HealthStatus::Unhealthy => {
                tracing::warn!(worker = %worker, %from, %to, "Worker unhealthy, excluded from selection")
            }
            _ => tracing::info!(worker = %worker, %from, %to, "Worker health changed"),
        }
        self.event_tx
            .send(Event::WorkerHealthChanged { worker, from, to })
            .ok();
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShuttingDown)
        }
    }

    /// Download one task on a selected worker
    pub async fn submit(&self, task: Task) -> Result<TaskOutcome> {
        self.ensure_accepting()?;
        let key = self.coordinator.enqueue(task).await;
        let worker = self.select_worker().ok_or(Error::NoWorkers)?;
        // Shutdown may have cleared the buffer in between
        let task = self
            .coordinator
            .dequeue(&key)
            .await
            .ok_or(Error::ShuttingDown)?;

        Ok(self.dispatch(worker, &task).await?)
    }

    /// Expand and download a batch of parent units
    ///
    /// Units run concurrently up to `post_limit × workers`; each holds a post
    /// slot on a selected worker while its tasks are distributed per task.
    /// Task failures are counted in the returned statistics, not returned as
    /// errors.
    pub async fn submit_batch<U, I, F>(&self, units: I, expand: F) -> Result<BatchStats>
    where
        I: IntoIterator<Item = U>,
        F: Fn(&U) -> Vec<Task>,
    {
        self.ensure_accepting()?;
        let limit = self.config.limits.post_limit * self.workers.len();
        let expand = &expand;

        let mut units: Vec<UnitStats> = futures::stream::iter(units.into_iter().enumerate())
            .map(|(index, unit)| async move {
                let tasks = expand(&unit);
                match self.select_worker() {
                    Some(owner) => owner.with_post_slot(self.run_unit(index, tasks)).await,
                    None => self.run_unit(index, tasks).await,
                }
            })
            .buffer_unordered(limit.max(1))
            .collect()
            .await;
        units.sort_by_key(|unit| unit.index);

        let mut totals = TaskCounts::default();
        for unit in &units {
            totals.merge(&unit.counts);
        }
        tracing::info!(
            units = units.len(),
            downloaded = totals.downloaded,
            skipped = totals.skipped,
            locked_elsewhere = totals.locked_elsewhere,
            failed = totals.failed,
            "Batch finished"
        );
        Ok(BatchStats { units, totals })
    }

    /// Run one unit's tasks; tasks dropped by a shutdown count as failed
    async fn run_unit(&self, index: usize, tasks: Vec<Task>) -> UnitStats {
        let total = tasks.len();
        let mut counts = TaskCounts::default();
        if !self.is_accepting() {
            counts.failed = total as u64;
            return UnitStats {
                index,
                tasks: total,
                counts,
            };
        }

        let mut keys = Vec::with_capacity(total);
        for task in tasks {
            keys.push(self.coordinator.enqueue(task).await);
        }

        let results = futures::future::join_all(keys.iter().map(|key| async move {
            let worker = self.select_worker().ok_or(Error::NoWorkers)?;
            let task = self
                .coordinator
                .dequeue(key)
                .await
                .ok_or(Error::ShuttingDown)?;
            Ok::<_, Error>(self.dispatch(worker, &task).await?)
        }))
        .await;

        for result in &results {
            counts.record(result);
        }
        UnitStats {
            index,
            tasks: total,
            counts,
        }
    }

    /// Run `task` on `worker` and feed the result into its health
    async fn dispatch(
        &self,
        worker: &Worker,
        task: &Task,
    ) -> std::result::Result<TaskOutcome, DownloadError> {
        let result = worker.download(task).await;
        match &result {
            Ok(TaskOutcome::Downloaded { .. }) => self.record_success(worker.id()),
            Ok(_) => {}
            Err(e) if e.counts_against_worker() => self.record_failure(worker.id(), e),
            Err(_) => {}
        }
        result
    }

    /// Per-worker and aggregated statistics
    pub async fn stats(&self) -> OrchestratorStats {
        let workers: Vec<_> = self.workers.iter().map(Worker::stats).collect();
        let mut totals = TaskCounts::default();
        for worker in &workers {
            totals.merge(&worker.counts);
        }
        let healthy_workers = (0..self.workers.len())
            .filter(|&i| self.health.status(i) == Some(HealthStatus::Healthy))
            .count();

        OrchestratorStats {
            workers,
            totals,
            pending_tasks: self.coordinator.pending_len().await,
            healthy_workers,
        }
    }

    /// Health snapshot of every worker, after applying due recoveries
    pub fn health(&self) -> Vec<WorkerHealthSnapshot> {
        self.workers
            .iter()
            .enumerate()
            .filter_map(|(index, worker)| {
                self.recover(index);
                let view = self.health.view(index)?;
                Some(WorkerHealthSnapshot {
                    worker: worker.id(),
                    identity: worker.identity().to_string(),
                    status: view.status,
                    consecutive_failures: view.consecutive_failures,
                    last_failure_at: view.last_failure_at,
                })
            })
            .collect()
    }

    /// Stop accepting tasks, drop pending ones and reset statistics
    ///
    /// In-flight transfers are not aborted; they finish on their own.
    pub async fn shutdown(&self) -> Result<()> {
        self.accepting.store(false, Ordering::SeqCst);
        let dropped = self.coordinator.clear_pending().await;
        for worker in &self.workers {
            worker.reset_stats();
        }
        self.pools.clear_cache();
        tracing::info!(dropped, "Orchestrator shut down");
        Ok(())
    }

    /// Whether new tasks are accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}
