//! The routine advance protocol
//!
//! A routine is a resumable computation advanced one step at a time. Each
//! step runs to its next suspension point and reports a [`YieldInstruction`],
//! or `None` when there are no more steps. Steps are atomic from the
//! scheduler's point of view: a routine never suspends mid-step.

use crate::instruction::YieldInstruction;

/// A resumable computation driven one step at a time.
///
/// Implement this by hand for explicit state machines, or use [`StepFn`] to
/// author a routine from a closure that keeps its state in captures.
pub trait Routine: Send + 'static {
    /// Advance one step on the host thread.
    ///
    /// Returns the instruction describing the next suspension, or `None`
    /// when the computation has finished.
    fn step(&mut self) -> Option<YieldInstruction>;

    /// Advance one step on a background worker thread.
    ///
    /// Routines that touch host-thread-only resources override this to use
    /// a thread-safe stepping path. The default forwards to [`Routine::step`].
    fn step_concurrent(&mut self) -> Option<YieldInstruction> {
        self.step()
    }

    /// Release resources held by the routine.
    ///
    /// Called exactly once, when the routine finishes or is cancelled.
    /// The routine is never stepped afterwards.
    fn dispose(&mut self) {}
}

/// A routine built from a step closure.
///
/// The closure is invoked once per advance and keeps all computation state
/// in its captures.
pub struct StepFn<F> {
    step: F,
}

impl<F> StepFn<F>
where
    F: FnMut() -> Option<YieldInstruction> + Send + 'static,
{
    /// Wrap a step closure into a routine.
    pub fn new(step: F) -> Self {
        Self { step }
    }
}

impl<F> Routine for StepFn<F>
where
    F: FnMut() -> Option<YieldInstruction> + Send + 'static,
{
    fn step(&mut self) -> Option<YieldInstruction> {
        (self.step)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Phase;

    #[test]
    fn test_step_fn_sequences_instructions() {
        let mut n = 0;
        let mut routine = StepFn::new(move || {
            n += 1;
            match n {
                1 => Some(YieldInstruction::at_phase(Phase::Update)),
                2 => Some(YieldInstruction::Poll),
                _ => None,
            }
        });

        assert!(matches!(
            routine.step(),
            Some(YieldInstruction::ResumeAtPhase(Phase::Update))
        ));
        assert!(matches!(routine.step(), Some(YieldInstruction::Poll)));
        assert!(routine.step().is_none());
    }

    #[test]
    fn test_step_concurrent_defaults_to_step() {
        let mut routine = StepFn::new(|| None);
        assert!(routine.step_concurrent().is_none());
    }
}
