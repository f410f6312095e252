//! Core types for attachment-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Deterministic task identity derived from the destination path
///
/// Two tasks with the same destination always share a key, regardless of
/// source URL, redirects or retries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKey(String);

impl TaskKey {
    /// Wrap an already-derived key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as stored in the coordination namespace
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file to download
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Source URL
    pub url: String,
    /// Where the file should end up on disk
    pub destination: PathBuf,
    /// Artist the file belongs to, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist_id: Option<String>,
    /// Post the file belongs to, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
}

impl Task {
    /// Create a task without identifying metadata
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            artist_id: None,
            post_id: None,
        }
    }

    /// Attach the owning artist and post
    pub fn with_post(mut self, artist_id: impl Into<String>, post_id: impl Into<String>) -> Self {
        self.artist_id = Some(artist_id.into());
        self.post_id = Some(post_id.into());
        self
    }
}

/// Lifecycle state of a task as seen through the coordination store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Known locally, not yet picked up
    Pending,
    /// A worker holds the lock and is transferring
    InProgress,
    /// A completion record exists
    Completed,
    /// The last cycle exhausted its retries
    Failed,
}

/// Why a task finished without a transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The destination file was already on disk
    AlreadyExists,
    /// Another worker recorded a completion for this key
    AlreadyCompleted,
}

/// Non-error result of submitting a task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The file was fetched and written
    Downloaded {
        /// Bytes written to the destination
        bytes: u64,
        /// Transfer attempts used, including the successful one
        attempts: u32,
        /// URL the body was finally served from
        final_url: String,
    },
    /// Nothing to do
    Skipped {
        /// Why the transfer was not needed
        reason: SkipReason,
    },
    /// Another holder owns the task; this worker did no network I/O
    LockedElsewhere {
        /// The recorded holder, if it could be read
        holder: Option<String>,
    },
}

/// Registration index of a worker within its orchestrator
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Health classification of a worker
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Eligible for selection
    #[default]
    Healthy,
    /// Recent failures, still eligible only under the fallback rule
    Degraded,
    /// Excluded from selection until recovery
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one worker's health
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealthSnapshot {
    /// Worker the snapshot belongs to
    pub worker: WorkerId,
    /// Egress path label (`direct` or `proxy:host:port`)
    pub identity: String,
    /// Current status
    pub status: HealthStatus,
    /// Failures since the last success or recovery
    pub consecutive_failures: u32,
    /// Wall-clock time of the most recent failure
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Task result counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    /// Files fetched by this process
    pub downloaded: u64,
    /// Files that were already present or already completed
    pub skipped: u64,
    /// Tasks yielded to another lock holder
    pub locked_elsewhere: u64,
    /// Tasks rejected after their attempt cycle
    pub failed: u64,
    /// Bytes written by successful transfers
    pub bytes: u64,
}

impl TaskCounts {
    /// Count one task result
    pub fn record<E>(&mut self, result: &Result<TaskOutcome, E>) {
        match result {
            Ok(TaskOutcome::Downloaded { bytes, .. }) => {
                self.downloaded += 1;
                self.bytes += bytes;
            }
            Ok(TaskOutcome::Skipped { .. }) => self.skipped += 1,
            Ok(TaskOutcome::LockedElsewhere { .. }) => self.locked_elsewhere += 1,
            Err(_) => self.failed += 1,
        }
    }

    /// Add another set of counters into this one
    pub fn merge(&mut self, other: &TaskCounts) {
        self.downloaded += other.downloaded;
        self.skipped += other.skipped;
        self.locked_elsewhere += other.locked_elsewhere;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }

    /// Number of task results counted
    pub fn total(&self) -> u64 {
        self.downloaded + self.skipped + self.locked_elsewhere + self.failed
    }
}

/// Statistics of a single worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Worker the statistics belong to
    pub worker: WorkerId,
    /// Egress path label
    pub identity: String,
    /// Task result counters since creation or the last reset
    pub counts: TaskCounts,
    /// Parent units waiting for or holding the post gate
    pub pending_posts: usize,
    /// Transfers waiting for or holding the attachment gate
    pub pending_attachments: usize,
}

impl WorkerStats {
    /// Combined pending units across both gates
    pub fn pending(&self) -> usize {
        self.pending_posts + self.pending_attachments
    }
}

/// Aggregated statistics of an orchestrator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    /// Per-worker statistics in registration order
    pub workers: Vec<WorkerStats>,
    /// Sum of all worker counters
    pub totals: TaskCounts,
    /// Tasks accepted but not yet dispatched to a worker
    pub pending_tasks: usize,
    /// Workers currently classified healthy
    pub healthy_workers: usize,
}

/// Result summary of one parent unit within a batch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStats {
    /// Position of the unit in the submitted batch
    pub index: usize,
    /// Tasks the unit expanded into
    pub tasks: usize,
    /// Results of those tasks
    pub counts: TaskCounts,
}

/// Result summary of a batch submission
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Per-unit summaries in submission order
    pub units: Vec<UnitStats>,
    /// Sum over all units
    pub totals: TaskCounts,
}

/// Event emitted during the task lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A worker acquired the lock and started transferring
    TaskStarted {
        /// Task key
        key: TaskKey,
        /// Worker holding the lock
        worker: WorkerId,
    },

    /// A transfer finished and the completion record was written
    TaskCompleted {
        /// Task key
        key: TaskKey,
        /// Worker that fetched the file
        worker: WorkerId,
        /// Bytes written
        bytes: u64,
    },

    /// The task needed no transfer
    TaskSkipped {
        /// Task key
        key: TaskKey,
        /// Worker that evaluated the task
        worker: WorkerId,
        /// Why it was skipped
        reason: SkipReason,
    },

    /// Another holder owns the task
    TaskLockedElsewhere {
        /// Task key
        key: TaskKey,
        /// Worker that lost the race
        worker: WorkerId,
    },

    /// An attempt failed and another one is scheduled
    TaskRetrying {
        /// Task key
        key: TaskKey,
        /// Worker retrying
        worker: WorkerId,
        /// Number of the upcoming retry (1-based)
        retry: u32,
        /// Delay before the retry in milliseconds
        delay_ms: u64,
        /// Error of the failed attempt
        error: String,
    },

    /// The task was rejected after its attempt cycle
    TaskFailed {
        /// Task key
        key: TaskKey,
        /// Worker that gave up
        worker: WorkerId,
        /// Terminal error
        error: String,
    },

    /// A worker's health classification changed
    WorkerHealthChanged {
        /// Worker whose status changed
        worker: WorkerId,
        /// Previous status
        from: HealthStatus,
        /// New status
        to: HealthStatus,
    },
}
