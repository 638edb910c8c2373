//! Host interface: clock and diagnostic channel
//!
//! The scheduler is embedded in a tick-driven host application. The host
//! supplies the scaled clock (its time-scale-aware game/sim time) and the
//! channel through which the scheduler reports non-fatal conditions. The
//! realtime clock is always `Instant` and is not host-pluggable.

use parking_lot::Mutex;
use std::fmt;
use std::time::Instant;

/// Non-fatal conditions reported through the host diagnostic channel.
///
/// Nothing here ever aborts the host tick loop; every condition is handled
/// best-effort after being reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Programmer misuse: internal-only yield from user code, host-thread
    /// entry point called off the host thread, use after dispose.
    Misuse(String),
    /// An awaited external dependency faulted; its waiter was abandoned.
    DependencyFailed(String),
    /// A background step panicked; the routine was disposed.
    BackgroundPanic(String),
    /// Disposal found external waits that never completed.
    DisposedPending {
        /// Number of still-pending external dependency waits.
        external_waits: usize,
    },
    /// Background migration requested on a host without worker threads;
    /// degraded to the poll lane. Reported once.
    NoWorkerPool,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Misuse(msg) => write!(f, "scheduler misuse: {}", msg),
            Diagnostic::DependencyFailed(msg) => {
                write!(f, "external dependency failed: {}", msg)
            }
            Diagnostic::BackgroundPanic(msg) => {
                write!(f, "background routine panicked: {}", msg)
            }
            Diagnostic::DisposedPending { external_waits } => write!(
                f,
                "disposed with {} external wait(s) still pending",
                external_waits
            ),
            Diagnostic::NoWorkerPool => {
                f.write_str("no worker pool available; background waits degrade to poll")
            }
        }
    }
}

/// The host application, as seen by the scheduler.
pub trait Host: Send + Sync + 'static {
    /// Current scaled time in seconds. Monotone non-decreasing; the host's
    /// time scale applies here (a paused host may hold this constant).
    fn scaled_time(&self) -> f64;

    /// Receive a scheduler diagnostic. The default forwards to the `log`
    /// crate; hosts with their own channels override this.
    fn report(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::Misuse(_) | Diagnostic::BackgroundPanic(_) => {
                log::error!("{}", diagnostic);
            }
            _ => log::warn!("{}", diagnostic),
        }
    }

    /// Whether background worker threads may be spawned. Single-threaded
    /// targets return `false` and background migration degrades to polling.
    fn background_allowed(&self) -> bool {
        true
    }
}

/// Host clock that follows wall time from creation. The default host for
/// applications without a custom time scale.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Clock starting at zero now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SystemClock {
    fn scaled_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven host clock, for tests and deterministic simulations.
pub struct ManualClock {
    time: Mutex<f64>,
}

impl ManualClock {
    /// Clock starting at zero.
    pub fn new() -> Self {
        Self {
            time: Mutex::new(0.0),
        }
    }

    /// Set the scaled time to an absolute value.
    pub fn set(&self, seconds: f64) {
        *self.time.lock() = seconds;
    }

    /// Advance the scaled time.
    pub fn advance(&self, seconds: f64) {
        *self.time.lock() += seconds;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for ManualClock {
    fn scaled_time(&self) -> f64 {
        *self.time.lock()
    }
}
