//! Scheduler error types

use thiserror::Error;

/// Errors surfaced by fallible scheduler entry points.
///
/// Configuration errors fail fast at construction time; everything that can
/// go wrong later is reported through the host diagnostic channel instead of
/// an error return, so the host tick loop never has to unwind.
#[derive(Debug, Error, PartialEq)]
pub enum SchedulerError {
    /// `poll_min_progress` must be a finite fraction in `[0, 1]`.
    #[error("poll minimum progress fraction {0} is outside [0, 1]")]
    ProgressFractionOutOfRange(f32),

    /// The process-wide default scheduler was already initialized.
    #[error("default scheduler already initialized")]
    AlreadyInitialized,
}
