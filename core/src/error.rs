//! Core Error Taxonomy
//!
//! The scheduling core never panics its way out of an operational failure.
//! Every fallible operation on the public API returns a `CoreError` variant
//! matching the taxonomy from the daemon's error handling design: admission
//! failures and cancellation/timeout are returned synchronously to the
//! caller, transient inference errors are retried internally and never
//! surface as `CoreError` unless no terminal arrives before the caller's
//! deadline, and GPU sampling failures never abort the process.

use thiserror::Error;

/// Why an `enqueue` call was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionRejectedReason {
    /// `total_queued >= capacity`.
    QueueFull,
    /// The task's class has a concurrency ceiling of zero (disabled).
    ClassDisabled,
}

impl std::fmt::Display for AdmissionRejectedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue is at capacity"),
            Self::ClassDisabled => write!(f, "task class is disabled (limit 0)"),
        }
    }
}

/// The unified error/outcome taxonomy for the scheduling core.
#[derive(Clone, Debug, Error)]
pub enum CoreError {
    /// Admission was rejected synchronously; the task was never queued.
    #[error("admission rejected: {0}")]
    AdmissionRejected(AdmissionRejectedReason),

    /// The task or in-flight generation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The caller's deadline elapsed before a terminal event arrived.
    #[error("timed out")]
    Timeout,

    /// A transient inference-transport error that was retried internally.
    ///
    /// This variant only ever reaches a caller wrapped inside `Timeout`
    /// (i.e. no terminal arrived before the deadline because of repeated
    /// transient failures); it is never returned on its own.
    #[error("transient inference error: {0}")]
    InferenceTransient(String),

    /// The inference server could not be spawned/reconnected after retries.
    #[error("inference server unavailable: {0}")]
    InferenceFatal(String),

    /// The GPU guard is permanently throttled (no usable device).
    #[error("GPU unavailable, scheduling paused")]
    GpuUnavailable,

    /// A config delta failed validation; the field names that failed.
    #[error("invalid config: {}", .0.join(", "))]
    ConfigInvalid(Vec<String>),
}

/// Convenience alias used throughout the core's public API.
pub type CoreResult<T> = Result<T, CoreError>;
