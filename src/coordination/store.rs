//! Coordination store abstraction.

use crate::error::StoreError;
use std::time::Duration;

/// Shared key/value store with per-key expiry
///
/// This is the only state mutated by more than one worker. Every mutation of a
/// task key goes through one of these primitives, and each primitive must be
/// atomic on its own: no application-level mutex sits on top.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Store `value` under `key` only if no unexpired value exists
    ///
    /// Returns `true` if this call created the entry.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Read the unexpired value under `key`
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Remove `key`; returns `true` if an unexpired entry was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove `key` only if its current value equals `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}
