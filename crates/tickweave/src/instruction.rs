//! Yield instructions: why a routine paused and what resumes it
//!
//! A routine communicates with the scheduler exclusively through the value it
//! returns from each step. The instruction names the bucket the routine is
//! filed into; the payload (deadline, predicate, pollable, child routine,
//! sibling handle) is owned by that bucket until the routine resumes.

use crate::handle::RoutineHandle;
use crate::pollable::Pollable;
use crate::routine::Routine;
use std::fmt;
use std::time::Duration;

/// A named point in the host's tick loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Main per-tick callback.
    Update,
    /// Runs after `Update` within the same tick.
    LateUpdate,
    /// Fixed-timestep callback; may fire zero or more times per tick.
    FixedUpdate,
    /// Last callback of the tick.
    EndOfFrame,
}

impl Phase {
    /// Number of distinct phases.
    pub const COUNT: usize = 4;

    /// All phases, in tick order.
    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::Update,
        Phase::LateUpdate,
        Phase::FixedUpdate,
        Phase::EndOfFrame,
    ];

    /// Dense index for per-phase bucket arrays.
    pub(crate) fn index(self) -> usize {
        match self {
            Phase::Update => 0,
            Phase::LateUpdate => 1,
            Phase::FixedUpdate => 2,
            Phase::EndOfFrame => 3,
        }
    }

    /// Human-readable phase name.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Update => "update",
            Phase::LateUpdate => "late_update",
            Phase::FixedUpdate => "fixed_update",
            Phase::EndOfFrame => "end_of_frame",
        }
    }
}

/// Zero-argument boolean condition for predicate waits.
pub type Predicate = Box<dyn FnMut() -> bool + Send>;

/// Why a routine paused, and what would resume it.
///
/// Exactly one instruction is produced per step. `Done` and `Parked` are
/// scheduler-internal; a user step that returns them is reported as misuse
/// through the host diagnostic channel and handled best-effort.
pub enum YieldInstruction {
    /// Resume on the next occurrence of the named phase.
    ResumeAtPhase(Phase),

    /// Resume once the scaled (host time-scale aware) clock has advanced
    /// past the given duration.
    ResumeAfter(Duration),

    /// Resume once the given wall-clock duration has elapsed.
    ResumeAfterRealtime(Duration),

    /// Resume once the predicate stops returning `true`.
    ResumeWhile(Predicate),

    /// Resume once the predicate starts returning `true`.
    ResumeUntil(Predicate),

    /// Resume once an opaque external awaitable reports completion.
    ResumeOnExternal(Box<dyn Pollable>),

    /// Delegate: run the child routine to completion, then resume.
    ResumeOnNested(Box<dyn Routine>),

    /// Resume once the routine behind the handle completes.
    ResumeOnSibling(RoutineHandle),

    /// Migrate execution to the short-lived worker pool.
    MoveToBackground,

    /// Migrate execution to the long-running worker pool.
    MoveToLongBackground,

    /// Migrate execution back to the host thread.
    MoveToForeground,

    /// Resume opportunistically within the per-tick poll budget.
    Poll,

    /// Terminal; the routine is disposed. Internal only.
    Done,

    /// Suspended indefinitely pending external wake. Internal only.
    Parked,
}

impl YieldInstruction {
    /// Resume on the next occurrence of `phase`.
    pub fn at_phase(phase: Phase) -> Self {
        YieldInstruction::ResumeAtPhase(phase)
    }

    /// Resume after `secs` seconds of scaled time.
    pub fn after_seconds(secs: f64) -> Self {
        YieldInstruction::ResumeAfter(Duration::from_secs_f64(secs))
    }

    /// Resume after `secs` seconds of wall-clock time.
    pub fn after_seconds_realtime(secs: f64) -> Self {
        YieldInstruction::ResumeAfterRealtime(Duration::from_secs_f64(secs))
    }

    /// Resume once `pred` returns `false`.
    pub fn wait_while(pred: impl FnMut() -> bool + Send + 'static) -> Self {
        YieldInstruction::ResumeWhile(Box::new(pred))
    }

    /// Resume once `pred` returns `true`.
    pub fn wait_until(pred: impl FnMut() -> bool + Send + 'static) -> Self {
        YieldInstruction::ResumeUntil(Box::new(pred))
    }

    /// Resume once `pollable` reports completion.
    pub fn external(pollable: impl Pollable) -> Self {
        YieldInstruction::ResumeOnExternal(Box::new(pollable))
    }

    /// Run `child` to completion, then resume.
    pub fn nested(child: impl Routine) -> Self {
        YieldInstruction::ResumeOnNested(Box::new(child))
    }

    /// Resume once the routine behind `handle` completes.
    pub fn sibling(handle: RoutineHandle) -> Self {
        YieldInstruction::ResumeOnSibling(handle)
    }

    /// Whether this variant is scheduler-internal and illegal from user code.
    pub fn is_internal(&self) -> bool {
        matches!(self, YieldInstruction::Done | YieldInstruction::Parked)
    }

    /// Discriminant name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            YieldInstruction::ResumeAtPhase(_) => "ResumeAtPhase",
            YieldInstruction::ResumeAfter(_) => "ResumeAfter",
            YieldInstruction::ResumeAfterRealtime(_) => "ResumeAfterRealtime",
            YieldInstruction::ResumeWhile(_) => "ResumeWhile",
            YieldInstruction::ResumeUntil(_) => "ResumeUntil",
            YieldInstruction::ResumeOnExternal(_) => "ResumeOnExternal",
            YieldInstruction::ResumeOnNested(_) => "ResumeOnNested",
            YieldInstruction::ResumeOnSibling(_) => "ResumeOnSibling",
            YieldInstruction::MoveToBackground => "MoveToBackground",
            YieldInstruction::MoveToLongBackground => "MoveToLongBackground",
            YieldInstruction::MoveToForeground => "MoveToForeground",
            YieldInstruction::Poll => "Poll",
            YieldInstruction::Done => "Done",
            YieldInstruction::Parked => "Parked",
        }
    }
}

impl fmt::Debug for YieldInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            YieldInstruction::ResumeAtPhase(phase) => {
                write!(f, "ResumeAtPhase({})", phase.name())
            }
            YieldInstruction::ResumeAfter(d) => write!(f, "ResumeAfter({:?})", d),
            YieldInstruction::ResumeAfterRealtime(d) => {
                write!(f, "ResumeAfterRealtime({:?})", d)
            }
            other => f.write_str(other.kind()),
        }
    }
}
