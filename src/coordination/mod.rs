//! Task coordination across workers and processes.
//!
//! - [`store`] - The [`CoordinationStore`] trait: atomic set-if-absent with expiry, read, delete
//! - [`memory`] - In-process store for single-process deployments and tests
//! - [`redis_store`] - Redis-backed store shared by every process of a deployment
//! - [`coordinator`] - The task protocol on top of a store (locks, markers, records)

pub mod coordinator;
pub mod memory;
pub mod redis_store;
pub mod store;


pub use coordinator::{
    CompletionRecord, FailureRecord, InProgressRecord, LockRecord, TaskCoordinator, derive_key,
};
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use store::CoordinationStore;
