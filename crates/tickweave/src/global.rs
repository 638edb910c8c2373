//! Process-wide default scheduler instance
//!
//! Call sites that cannot thread a `Scheduler` reference through explicitly
//! can use this thin wrapper instead. The lifecycle is explicit: nothing
//! auto-initializes, and `teardown` disposes the instance.

use crate::error::SchedulerError;
use crate::handle::RoutineHandle;
use crate::routine::Routine;
use crate::scheduler::Scheduler;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;

static DEFAULT: Lazy<RwLock<Option<Arc<Scheduler>>>> = Lazy::new(|| RwLock::new(None));

/// Install `scheduler` as the process-wide default.
pub fn init(scheduler: Scheduler) -> Result<(), SchedulerError> {
    init_arc(Arc::new(scheduler))
}

/// Install an already-shared scheduler as the process-wide default.
pub fn init_arc(scheduler: Arc<Scheduler>) -> Result<(), SchedulerError> {
    let mut slot = DEFAULT.write();
    if slot.is_some() {
        return Err(SchedulerError::AlreadyInitialized);
    }
    *slot = Some(scheduler);
    Ok(())
}

/// Dispose and remove the default instance. Returns it, already disposed,
/// if one was installed.
pub fn teardown() -> Option<Arc<Scheduler>> {
    let scheduler = DEFAULT.write().take()?;
    if !scheduler.is_disposed() {
        scheduler.dispose();
    }
    Some(scheduler)
}

/// Run `f` against the default instance, if one is installed.
pub fn with<T>(f: impl FnOnce(&Scheduler) -> T) -> Option<T> {
    let slot = DEFAULT.read();
    slot.as_deref().map(f)
}

/// Start a routine on the default instance. Returns `false` if no default
/// is installed.
pub fn start<R: Routine>(routine: R) -> bool {
    with(|scheduler| scheduler.start(routine)).is_some()
}

/// Start a routine with a completion handle on the default instance.
pub fn start_with_handle<R: Routine>(routine: R) -> Option<RoutineHandle> {
    with(|scheduler| scheduler.start_with_handle(routine))
}
