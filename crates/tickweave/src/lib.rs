//! Tickweave, a cooperative routine scheduler for tick-driven hosts
//!
//! Tickweave multiplexes large numbers of independently suspended, resumable
//! computations ("routines") across the named phases of a host tick loop and
//! two background worker pools. Routines communicate with the scheduler by
//! returning a [`YieldInstruction`] from each step: resume on a phase, after
//! a timer, when a predicate flips, when an external awaitable or a sibling
//! routine completes, or after migrating to and from a worker thread.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tickweave::{Phase, Scheduler, StepFn, SystemClock, YieldInstruction};
//!
//! let scheduler = Scheduler::create(Arc::new(SystemClock::new()), 5, 0.1)?;
//!
//! let mut step = 0;
//! scheduler.start(StepFn::new(move || {
//!     step += 1;
//!     match step {
//!         1 => Some(YieldInstruction::after_seconds(2.0)),
//!         2 => Some(YieldInstruction::at_phase(Phase::EndOfFrame)),
//!         _ => None,
//!     }
//! }));
//!
//! // Host tick loop:
//! scheduler.on_update();
//! scheduler.on_poll();
//! scheduler.on_fixed_update();
//! scheduler.on_late_update();
//! scheduler.on_end_of_frame();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Background worker pools and migration categories.
pub mod background;

/// Cancellation checks: none, token, host-entity liveness.
pub mod cancel;

/// Scheduler error types.
pub mod error;

/// Process-wide default scheduler instance.
pub mod global;

/// Pooled, generation-tagged completion handles.
pub mod handle;

/// Host interface: clock and diagnostic channel.
pub mod host;

/// Yield instructions and tick phases.
pub mod instruction;

/// External awaitables polled for completion.
pub mod pollable;

/// The routine advance protocol.
pub mod routine;

/// The top-level scheduler.
pub mod scheduler;

mod shard;

pub use background::PoolKind;
pub use cancel::{CancelCheck, CancelToken, Liveness, LivenessCancel, NeverCancel};
pub use error::SchedulerError;
pub use handle::RoutineHandle;
pub use host::{Diagnostic, Host, ManualClock, SystemClock};
pub use instruction::{Phase, Predicate, YieldInstruction};
pub use pollable::{FutureDone, JobHandle, PollFn, PollStatus, Pollable};
pub use routine::{Routine, StepFn};
pub use scheduler::{Scheduler, SchedulerStats};
