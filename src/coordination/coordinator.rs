//! Task protocol on top of a [`CoordinationStore`].
//!
//! Store key namespace (shared with every compatible process):
//!
//! | Key | Value | TTL |
//! |---|---|---|
//! | `task-lock:{key}` | [`LockRecord`] | lock TTL |
//! | `task-in-progress:{key}` | [`InProgressRecord`] | lock TTL |
//! | `task-completed:{key}` | [`CompletionRecord`] | retention |
//! | `task-failed:{key}` | [`FailureRecord`] | retention |
//! | `skip-cache:{key}` | skip reason | skip-cache TTL |

use super::store::CoordinationStore;
use crate::config::CoordinationConfig;
use crate::error::StoreError;
use crate::types::{Task, TaskKey, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const LOCK_PREFIX: &str = "task-lock";
const IN_PROGRESS_PREFIX: &str = "task-in-progress";
const COMPLETED_PREFIX: &str = "task-completed";
const FAILED_PREFIX: &str = "task-failed";
const SKIP_PREFIX: &str = "skip-cache";

/// Derive the task key from a destination path
///
/// SHA-256 of the path as written, hex encoded. Identical paths always give
/// identical keys; the source URL plays no part.
pub fn derive_key(destination: &Path) -> TaskKey {
    let mut hasher = Sha256::new();
    hasher.update(destination.to_string_lossy().as_bytes());
    TaskKey::new(format!("{:x}", hasher.finalize()))
}

/// Value of `task-lock:{key}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Holder identity
    pub holder: String,
    /// When the lock was taken
    pub acquired_at: DateTime<Utc>,
}

/// Value of `task-in-progress:{key}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressRecord {
    /// Holder identity
    pub holder: String,
    /// When the transfer started
    pub started_at: DateTime<Utc>,
}

/// Records tagged with the holder that wrote them
trait HolderRecord: for<'de> Deserialize<'de> {
    fn holder(&self) -> &str;
}

impl HolderRecord for LockRecord {
    fn holder(&self) -> &str {
        &self.holder
    }
}

impl HolderRecord for InProgressRecord {
    fn holder(&self) -> &str {
        &self.holder
    }
}

/// Value of `task-completed:{key}`; presence short-circuits every later attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Holder that fetched the file
    pub holder: String,
    /// URL the body was served from after redirects
    pub url: String,
    /// Where the file was written
    pub destination: PathBuf,
    /// Bytes written
    pub size_bytes: u64,
    /// When the transfer finished
    pub completed_at: DateTime<Utc>,
}

/// Value of `task-failed:{key}`; informational, never blocks resubmission
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Holder that gave up
    pub holder: String,
    /// Terminal error message
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    /// Transfer attempts made
    pub attempts: u32,
    /// When the task was given up
    pub failed_at: DateTime<Utc>,
}

/// Task-level protocol over a shared store plus a local pending buffer
pub struct TaskCoordinator {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
    skip_cache_ttl: Duration,
    pending: Mutex<VecDeque<(TaskKey, Task)>>,
}

impl TaskCoordinator {
    /// Create a coordinator over `store`
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: CoordinationConfig,
        skip_cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            config,
            skip_cache_ttl,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Key of `task`, derived from its destination
    pub fn derive_key(task: &Task) -> TaskKey {
        derive_key(&task.destination)
    }

    fn store_key(&self, namespace: &str, key: &TaskKey) -> String {
        format!("{}{}:{}", self.config.key_prefix, namespace, key)
    }

    /// Try to take the lock for `key`; `Ok(false)` means another holder has it
    pub async fn acquire_lock(&self, key: &TaskKey, holder: &str) -> Result<bool, StoreError> {
        let record = LockRecord {
            holder: holder.to_string(),
            acquired_at: Utc::now(),
        };
        let value = serde_json::to_string(&record)?;
        self.store
            .set_if_absent(
                &self.store_key(LOCK_PREFIX, key),
                &value,
                self.config.lock_ttl,
            )
            .await
    }

    /// Release the lock for `key` if `holder` still owns it
    ///
    /// A late release after the TTL expired and someone else re-acquired the
    /// lock returns `Ok(false)` and leaves the newer lock alone.
    pub async fn release_lock(&self, key: &TaskKey, holder: &str) -> Result<bool, StoreError> {
        self.delete_if_held::<LockRecord>(&self.store_key(LOCK_PREFIX, key), holder)
            .await
    }

    /// Current lock holder of `key`, if locked
    pub async fn get_lock_holder(&self, key: &TaskKey) -> Result<Option<String>, StoreError> {
        let record: Option<LockRecord> = self.read(&self.store_key(LOCK_PREFIX, key)).await?;
        Ok(record.map(|r| r.holder))
    }

    /// Record that `holder` started transferring `key`
    pub async fn mark_in_progress(&self, key: &TaskKey, holder: &str) -> Result<(), StoreError> {
        let record = InProgressRecord {
            holder: holder.to_string(),
            started_at: Utc::now(),
        };
        self.store
            .set(
                &self.store_key(IN_PROGRESS_PREFIX, key),
                &serde_json::to_string(&record)?,
                self.config.lock_ttl,
            )
            .await
    }

    /// Record success, then clear the holder's lock and in-progress marker
    ///
    /// The completion record is written with set-if-absent, so the first
    /// completion of a key is never overwritten. Returns `false` if a record
    /// already existed.
    pub async fn mark_completed(
        &self,
        key: &TaskKey,
        record: &CompletionRecord,
    ) -> Result<bool, StoreError> {
        let created = self
            .store
            .set_if_absent(
                &self.store_key(COMPLETED_PREFIX, key),
                &serde_json::to_string(record)?,
                self.config.retention_ttl,
            )
            .await?;

        self.delete_if_held::<InProgressRecord>(
            &self.store_key(IN_PROGRESS_PREFIX, key),
            &record.holder,
        )
        .await?;
        self.release_lock(key, &record.holder).await?;
        Ok(created)
    }

    /// Record a terminal failure and clear the holder's in-progress marker
    pub async fn mark_failed(
        &self,
        key: &TaskKey,
        record: &FailureRecord,
    ) -> Result<(), StoreError> {
        self.store
            .set(
                &self.store_key(FAILED_PREFIX, key),
                &serde_json::to_string(record)?,
                self.config.retention_ttl,
            )
            .await?;
        self.delete_if_held::<InProgressRecord>(
            &self.store_key(IN_PROGRESS_PREFIX, key),
            &record.holder,
        )
        .await?;
        Ok(())
    }

    /// Whether a completion record exists for `key`
    pub async fn is_completed(&self, key: &TaskKey) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&self.store_key(COMPLETED_PREFIX, key))
            .await?
            .is_some())
    }

    /// Completion record of `key`, if any
    pub async fn completion(&self, key: &TaskKey) -> Result<Option<CompletionRecord>, StoreError> {
        self.read(&self.store_key(COMPLETED_PREFIX, key)).await
    }

    /// Failure record of `key`, if any
    pub async fn failure(&self, key: &TaskKey) -> Result<Option<FailureRecord>, StoreError> {
        self.read(&self.store_key(FAILED_PREFIX, key)).await
    }

    /// Coordination state of `key`
    ///
    /// Completed wins over in-progress, which wins over failed; a key with
    /// none of the records is pending.
    pub async fn state(&self, key: &TaskKey) -> Result<TaskState, StoreError> {
        if self.is_completed(key).await? {
            return Ok(TaskState::Completed);
        }
        if self
            .store
            .get(&self.store_key(IN_PROGRESS_PREFIX, key))
            .await?
            .is_some()
        {
            return Ok(TaskState::InProgress);
        }
        if self
            .store
            .get(&self.store_key(FAILED_PREFIX, key))
            .await?
            .is_some()
        {
            return Ok(TaskState::Failed);
        }
        Ok(TaskState::Pending)
    }

    /// Whether a recent timeout left a skip marker for `key`
    pub async fn is_skip_marked(&self, key: &TaskKey) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get(&self.store_key(SKIP_PREFIX, key))
            .await?
            .is_some())
    }

    /// Suppress attempts on `key` by any worker for the skip-cache TTL
    pub async fn set_skip_marker(&self, key: &TaskKey, reason: &str) -> Result<(), StoreError> {
        self.store
            .set(&self.store_key(SKIP_PREFIX, key), reason, self.skip_cache_ttl)
            .await
    }

    /// Add a task to the local pending buffer and return its key
    pub async fn enqueue(&self, task: Task) -> TaskKey {
        let key = Self::derive_key(&task);
        self.pending.lock().await.push_back((key.clone(), task));
        key
    }

    /// Remove the first pending entry for `key`
    pub async fn dequeue(&self, key: &TaskKey) -> Option<Task> {
        let mut pending = self.pending.lock().await;
        let index = pending.iter().position(|(k, _)| k == key)?;
        pending.remove(index).map(|(_, task)| task)
    }

    /// Tasks accepted but not yet handed to a worker
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Drop every pending task, returning how many were dropped
    pub async fn clear_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    async fn read<T>(&self, store_key: &str) -> Result<Option<T>, StoreError>
    where
        T: for<'de> Deserialize<'de>,
    {
        match self.store.get(store_key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a holder-tagged record only if `holder` wrote it
    async fn delete_if_held<T>(&self, store_key: &str, holder: &str) -> Result<bool, StoreError>
    where
        T: HolderRecord,
    {
        let Some(raw) = self.store.get(store_key).await? else {
            return Ok(false);
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(record) if record.holder() == holder => {
                self.store.delete_if_equals(store_key, &raw).await
            }
            Ok(_) => Ok(false),
            Err(e) => {
                tracing::warn!(key = store_key, error = %e, "Unreadable holder record, leaving it to expire");
                Ok(false)
            }
        }
    }
}
