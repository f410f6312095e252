//! Worker health tracking.
//!
//! Health only changes through three transitions: a counted failure, a
//! successful transfer, and lazy recovery once the cooldown has elapsed since
//! the last failure. There is no background timer.

use crate::config::HealthConfig;
use crate::types::HealthStatus;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};
use tokio::time::Instant;

/// A status change to be logged and broadcast
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Transition {
    pub(super) from: HealthStatus,
    pub(super) to: HealthStatus,
}

#[derive(Clone, Debug, Default)]
struct Entry {
    status: HealthStatus,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Point-in-time health of one worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct HealthView {
    pub(super) status: HealthStatus,
    pub(super) consecutive_failures: u32,
    pub(super) last_failure_at: Option<DateTime<Utc>>,
}

/// Health state of every registered worker, indexed by registration order
pub(super) struct HealthTracker {
    config: HealthConfig,
    entries: Mutex<Vec<Entry>>,
}

impl HealthTracker {
    /// Seed `workers` entries as healthy
    pub(super) fn new(config: HealthConfig, workers: usize) -> Self {
        Self {
            config,
            entries: Mutex::new(vec![Entry::default(); workers]),
        }
    }

    fn classify(&self, failures: u32) -> HealthStatus {
        if failures >= self.config.unhealthy_threshold {
            HealthStatus::Unhealthy
        } else if failures >= self.config.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn update<F>(&self, index: usize, f: F) -> Option<Transition>
    where
        F: FnOnce(&mut Entry),
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(index)?;
        let from = entry.status;
        f(entry);
        (entry.status != from).then_some(Transition {
            from,
            to: entry.status,
        })
    }

    /// Count one failure against worker `index`
    pub(super) fn record_failure(&self, index: usize) -> Option<Transition> {
        self.update(index, |entry| {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.last_failure = Some(Instant::now());
            entry.last_failure_at = Some(Utc::now());
            entry.status = self.classify(entry.consecutive_failures);
        })
    }

    /// A successful transfer ends the failure streak
    pub(super) fn record_success(&self, index: usize) -> Option<Transition> {
        self.update(index, |entry| {
            entry.consecutive_failures = 0;
            entry.status = HealthStatus::Healthy;
        })
    }

    /// Reset worker `index` if the cooldown has passed since its last failure
    pub(super) fn attempt_recovery(&self, index: usize) -> Option<Transition> {
        let cooldown = self.config.recovery_cooldown;
        self.update(index, |entry| {
            if entry.consecutive_failures == 0 {
                return;
            }
            let cooled = entry
                .last_failure
                .is_some_and(|at| at.elapsed() >= cooldown);
            if cooled {
                entry.consecutive_failures = 0;
                entry.status = HealthStatus::Healthy;
            }
        })
    }

    /// Current view of worker `index`
    pub(super) fn view(&self, index: usize) -> Option<HealthView> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(index).map(|entry| HealthView {
            status: entry.status,
            consecutive_failures: entry.consecutive_failures,
            last_failure_at: entry.last_failure_at,
        })
    }

    /// Current status of worker `index`
    pub(super) fn status(&self, index: usize) -> Option<HealthStatus> {
        self.view(index).map(|view| view.status)
    }
}
