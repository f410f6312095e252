//! Retry classification and exponential backoff
//!
//! The worker drives its own attempt loop (it has to re-check skip markers and
//! lock ownership between attempts); this module supplies the two pieces that
//! loop needs: whether an error is worth another attempt, and how long to wait
//! before it.
//!
//! # Example
//!
//! ```
//! use attachment_dl::config::RetryConfig;
//! use attachment_dl::retry::backoff_delay;
//! use std::time::Duration;
//!
//! let config = RetryConfig::default();
//! assert_eq!(backoff_delay(&config, 1), Duration::from_millis(1000));
//! assert_eq!(backoff_delay(&config, 3), Duration::from_millis(4000));
//! ```

use crate::config::RetryConfig;
use crate::error::DownloadError;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connection resets, bad gateways) return `true`.
/// Benign or terminal outcomes (already present, locked elsewhere, skip-marked)
/// return `false`.
pub trait IsRetryable {
    /// Returns true if another attempt may succeed
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for DownloadError {
    fn is_retryable(&self) -> bool {
        match self {
            DownloadError::TooManyRedirects { .. }
            | DownloadError::HttpStatus { .. }
            | DownloadError::Timeout { .. }
            | DownloadError::Transport(_)
            | DownloadError::Io(_)
            | DownloadError::CoordinationUnavailable(_) => true,
            // The destination path itself is unusable; waiting will not fix it
            DownloadError::DestinationCheck(_) => false,
            // Another worker owns the task; waiting would only convoy
            DownloadError::LockedElsewhere { .. } => false,
            DownloadError::AlreadyExists => false,
            DownloadError::SkipMarked => false,
            DownloadError::RetriesExhausted { .. } => false,
        }
    }
}

/// Delay before retry number `retry` (1-based), without jitter
///
/// `base_delay * backoff_multiplier^(retry-1)`, capped at `max_delay`.
/// `retry == 0` means "no retry yet" and yields zero.
pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    if retry == 0 {
        return Duration::ZERO;
    }
    let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
    let nanos = config.base_delay.as_nanos() as f64 * config.backoff_multiplier.powi(exponent);
    if !nanos.is_finite() || nanos >= config.max_delay.as_nanos() as f64 {
        return config.max_delay;
    }
    Duration::from_nanos(nanos.round() as u64)
}

/// Delay before retry number `retry`, with jitter applied when configured
pub fn retry_delay(config: &RetryConfig, retry: u32) -> Duration {
    let delay = backoff_delay(config, retry);
    if config.jitter {
        add_jitter(delay)
    } else {
        delay
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
