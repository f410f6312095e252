//! # attachment-dl
//!
//! Download-coordination core for fetching large numbers of remote file
//! attachments through one or more egress paths (direct or proxied).
//!
//! ## Design Philosophy
//!
//! attachment-dl is designed to be:
//! - **Duplicate-free** - A file is fetched by at most one worker at a time, across processes
//! - **Bounded** - Per-worker concurrency gates, bounded retries with exponential backoff
//! - **Self-healing** - Failing workers are excluded and recover after a cooldown
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use attachment_dl::{Config, InMemoryStore, Orchestrator, Task};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let orchestrator = Orchestrator::new(config, Arc::new(InMemoryStore::new()))?;
//!
//!     // Subscribe to events
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let outcome = orchestrator
//!         .submit(Task::new("https://cdn.example.com/a.png", "/data/42/7/a.png"))
//!         .await?;
//!     println!("{outcome:?}");
//!
//!     orchestrator.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Coordination store and task protocol
pub mod coordination;
/// Error types
pub mod error;
/// Worker selection, health and batch processing
pub mod orchestrator;
/// Pooled HTTP clients per worker identity
pub mod pool;
/// Retry classification and backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Per-egress-path download worker
pub mod worker;

// Re-export commonly used types
pub use config::{Config, DistributionStrategy, WorkerConfig, WorkerIdentity};
pub use coordination::{CoordinationStore, InMemoryStore, RedisStore, TaskCoordinator};
pub use error::{DownloadError, Error, Result, StoreError};
pub use orchestrator::Orchestrator;
pub use pool::ClientPoolFactory;
pub use types::{
    BatchStats, Event, HealthStatus, OrchestratorStats, SkipReason, Task, TaskKey, TaskOutcome,
    TaskState, WorkerHealthSnapshot, WorkerId, WorkerStats,
};
pub use worker::Worker;

/// Helper function to run the orchestrator with graceful signal handling.
///
/// Waits for a termination signal and then calls the orchestrator's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use attachment_dl::{Config, InMemoryStore, Orchestrator, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let orchestrator = Orchestrator::new(Config::default(), Arc::new(InMemoryStore::new()))?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(&orchestrator).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(orchestrator: &Orchestrator) -> Result<()> {
    wait_for_signal().await;
    orchestrator.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C signal"),
    }
}
