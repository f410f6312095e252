//! Error types for attachment-dl
//!
//! This module provides the error taxonomy of the coordination core:
//! - [`Error`] for orchestrator-level operations (configuration, lifecycle, I/O)
//! - [`DownloadError`] for the outcome of a single task's transfer cycle
//! - [`StoreError`] for coordination-store round trips
//!
//! Nothing in this crate treats an error as process-fatal. Download errors are
//! surfaced to the caller as rejected task outcomes; store errors make the
//! worker refuse to download rather than risk a duplicate transfer.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for attachment-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for attachment-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "POST_LIMIT")
        key: Option<String>,
    },

    /// No worker descriptor survived validation
    #[error("no valid workers configured")]
    NoWorkers,

    /// Shutdown in progress - not accepting new tasks
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,

    /// Coordination store failure outside of a task cycle
    #[error("coordination store error: {0}")]
    Coordination(#[from] StoreError),

    /// A task was rejected after its transfer cycle
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error while building or using a pooled client
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub(crate) fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}

/// Failure of a single download task
///
/// `AlreadyExists` and `LockedElsewhere` are benign: the worker maps them to
/// non-error outcomes and never retries them. Everything else is either
/// retried under the retry policy or terminal for the current attempt cycle.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The destination file is already present on disk
    #[error("destination already exists")]
    AlreadyExists,

    /// Another holder owns the task lock
    #[error("task is locked by {}", holder.as_deref().unwrap_or("another worker"))]
    LockedElsewhere {
        /// The recorded lock holder, if it could be read
        holder: Option<String>,
    },

    /// A recent timeout left a skip marker for this destination
    #[error("destination is skip-marked after a recent timeout")]
    SkipMarked,

    /// The redirect chain exceeded the configured hop ceiling
    #[error("too many redirects (limit {limit})")]
    TooManyRedirects {
        /// Maximum number of redirect hops allowed
        limit: u32,
    },

    /// The server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// URL that produced the status
        url: String,
    },

    /// The transfer exceeded the per-download deadline
    #[error("download timed out after {after:?}")]
    Timeout {
        /// The deadline that was exceeded
        after: Duration,
    },

    /// Connection, TLS, proxy or body-stream failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The destination could not be inspected before claiming the task
    #[error("destination check failed: {0}")]
    DestinationCheck(#[source] std::io::Error),

    /// Local filesystem failure while writing the destination
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Exclusivity could not be confirmed with the coordination store
    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    /// All attempts failed; wraps the error of the final attempt
    #[error("failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of transfer attempts made
        attempts: u32,
        /// Error of the final attempt
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    /// The innermost error, unwrapping [`DownloadError::RetriesExhausted`]
    pub fn root(&self) -> &DownloadError {
        match self {
            DownloadError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    /// Whether this failure says something about the worker's egress path
    ///
    /// Skip markers and store outages are not the worker's fault and must not
    /// push it towards `unhealthy`.
    pub fn counts_against_worker(&self) -> bool {
        match self.root() {
            DownloadError::TooManyRedirects { .. }
            | DownloadError::HttpStatus { .. }
            | DownloadError::Timeout { .. }
            | DownloadError::Transport(_)
            | DownloadError::Io(_) => true,
            DownloadError::AlreadyExists
            | DownloadError::LockedElsewhere { .. }
            | DownloadError::SkipMarked
            | DownloadError::DestinationCheck(_)
            | DownloadError::CoordinationUnavailable(_)
            | DownloadError::RetriesExhausted { .. } => false,
        }
    }

    /// Short machine-readable code used in failure records and events
    pub fn code(&self) -> &'static str {
        match self {
            DownloadError::AlreadyExists => "already_exists",
            DownloadError::LockedElsewhere { .. } => "locked_elsewhere",
            DownloadError::SkipMarked => "skip_marked",
            DownloadError::TooManyRedirects { .. } => "too_many_redirects",
            DownloadError::HttpStatus { .. } => "http_status",
            DownloadError::Timeout { .. } => "timeout",
            DownloadError::Transport(_) => "transport",
            DownloadError::DestinationCheck(_) => "destination_check",
            DownloadError::Io(_) => "io",
            DownloadError::CoordinationUnavailable(_) => "coordination_unavailable",
            DownloadError::RetriesExhausted { last, .. } => last.code(),
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return DownloadError::HttpStatus {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        DownloadError::Transport(e.to_string())
    }
}

impl From<StoreError> for DownloadError {
    fn from(e: StoreError) -> Self {
        DownloadError::CoordinationUnavailable(e.to_string())
    }
}

/// Coordination store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Redis command failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored record could not be encoded or decoded
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_elsewhere_names_the_holder_when_known() {
        let known = DownloadError::LockedElsewhere {
            holder: Some("proxy:10.0.0.1:3128".to_string()),
        };
        assert_eq!(known.to_string(), "task is locked by proxy:10.0.0.1:3128");

        let unknown = DownloadError::LockedElsewhere { holder: None };
        assert_eq!(unknown.to_string(), "task is locked by another worker");
    }

    #[test]
    fn exhausted_error_reports_root_code() {
        let err = DownloadError::RetriesExhausted {
            attempts: 4,
            last: Box::new(DownloadError::TooManyRedirects { limit: 1 }),
        };

        assert_eq!(err.code(), "too_many_redirects");
        assert!(matches!(err.root(), DownloadError::TooManyRedirects { .. }));
        assert!(err.to_string().starts_with("failed after 4 attempts"));
    }

    #[test]
    fn only_egress_failures_count_against_worker() {
        assert!(DownloadError::Timeout {
            after: Duration::from_secs(1)
        }
        .counts_against_worker());
        assert!(DownloadError::Transport("reset".into()).counts_against_worker());
        assert!(
            DownloadError::RetriesExhausted {
                attempts: 2,
                last: Box::new(DownloadError::HttpStatus {
                    status: 503,
                    url: "http://x".into()
                }),
            }
            .counts_against_worker()
        );

        assert!(!DownloadError::SkipMarked.counts_against_worker());
        assert!(!DownloadError::CoordinationUnavailable("down".into()).counts_against_worker());
        assert!(!DownloadError::LockedElsewhere { holder: None }.counts_against_worker());
        assert!(
            !DownloadError::DestinationCheck(std::io::ErrorKind::NotADirectory.into())
                .counts_against_worker()
        );
    }

    #[test]
    fn store_error_becomes_coordination_unavailable() {
        let err: DownloadError = StoreError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, DownloadError::CoordinationUnavailable(_)));
        assert_eq!(err.code(), "coordination_unavailable");
    }
}
