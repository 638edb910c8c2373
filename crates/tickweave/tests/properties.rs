//! End-to-end scheduler properties exercised through the public API.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tickweave::{
    CancelToken, Diagnostic, Host, JobHandle, ManualClock, Phase, PoolKind, Routine, Scheduler,
    StepFn, YieldInstruction,
};

/// Manual-clock host that records every diagnostic it receives.
struct TestHost {
    clock: ManualClock,
    diagnostics: Mutex<Vec<Diagnostic>>,
    background: bool,
}

impl TestHost {
    fn new(background: bool) -> Arc<Self> {
        Arc::new(Self {
            clock: ManualClock::new(),
            diagnostics: Mutex::new(Vec::new()),
            background,
        })
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }
}

impl Host for TestHost {
    fn scaled_time(&self) -> f64 {
        self.clock.scaled_time()
    }

    fn report(&self, diagnostic: Diagnostic) {
        self.diagnostics.lock().push(diagnostic);
    }

    fn background_allowed(&self) -> bool {
        self.background
    }
}

fn scheduler_with(host: Arc<TestHost>) -> Scheduler {
    Scheduler::create(host, 5, 0.1).expect("valid scheduler config")
}

/// Routine that re-yields the same instruction forever and tracks its
/// lifecycle.
struct Tracked {
    steps: Arc<AtomicUsize>,
    disposed: Arc<AtomicBool>,
    phase: Phase,
}

impl Routine for Tracked {
    fn step(&mut self) -> Option<YieldInstruction> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        Some(YieldInstruction::at_phase(self.phase))
    }

    fn dispose(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn completion_fires_exactly_once_and_is_monotone() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host);

    let mut remaining = 2;
    let handle = scheduler.start_with_handle(StepFn::new(move || {
        remaining -= 1;
        if remaining > 0 {
            Some(YieldInstruction::at_phase(Phase::Update))
        } else {
            None
        }
    }));

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    handle.on_completed(move || {
        observed.fetch_add(1, Ordering::SeqCst);
    });

    assert!(!handle.is_completed());
    scheduler.on_update();
    assert!(handle.is_completed());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Monotone: further phases never un-complete it.
    scheduler.on_update();
    scheduler.on_late_update();
    assert!(handle.is_completed());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    scheduler.dispose();
}

#[test]
fn stale_handle_observes_completion_after_recycle() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host);

    // First run completes during start, recycling its slot.
    let stale = scheduler.start_with_handle(StepFn::new(|| None));
    assert!(stale.is_completed());

    // Second run rents the recycled slot with a fresh generation.
    let fresh = scheduler.start_with_handle(StepFn::new(|| {
        Some(YieldInstruction::at_phase(Phase::Update))
    }));
    assert!(!fresh.is_completed());

    // The stale handle still reports completed, and its continuation runs
    // synchronously instead of hanging.
    assert!(stale.is_completed());
    let fired = Arc::new(AtomicBool::new(false));
    let observed = fired.clone();
    stale.on_completed(move || observed.store(true, Ordering::SeqCst));
    assert!(fired.load(Ordering::SeqCst));

    scheduler.dispose();
}

#[test]
fn cancellation_disposes_and_never_resumes() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host);

    let steps = Arc::new(AtomicUsize::new(0));
    let disposed = Arc::new(AtomicBool::new(false));
    let token = CancelToken::new();

    let handle = scheduler.start_cancellable_with_handle(
        Tracked {
            steps: steps.clone(),
            disposed: disposed.clone(),
            phase: Phase::Update,
        },
        token.clone(),
    );

    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 2);

    token.cancel();
    scheduler.on_update();
    scheduler.on_update();

    // Disposed at the next dispatch point, never stepped again.
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    assert!(disposed.load(Ordering::SeqCst));
    assert!(handle.is_completed());

    scheduler.dispose();
}

#[test]
fn phase_waits_resume_only_on_their_phase() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host);

    let steps = Arc::new(AtomicUsize::new(0));
    let counted = steps.clone();
    scheduler.start(StepFn::new(move || {
        counted.fetch_add(1, Ordering::SeqCst);
        Some(YieldInstruction::at_phase(Phase::FixedUpdate))
    }));
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    scheduler.on_update();
    scheduler.on_poll();
    scheduler.on_late_update();
    scheduler.on_end_of_frame();
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    scheduler.on_fixed_update();
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    scheduler.on_fixed_update();
    assert_eq!(steps.load(Ordering::SeqCst), 3);

    scheduler.dispose();
}

#[test]
fn nested_resumption_preserves_parent_destination() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host);

    let parent_steps = Arc::new(AtomicUsize::new(0));
    let child_steps = Arc::new(AtomicUsize::new(0));

    let parent_counted = parent_steps.clone();
    let child_counted = child_steps.clone();
    let handle = scheduler.start_with_handle(StepFn::new(move || {
        let step = parent_counted.fetch_add(1, Ordering::SeqCst) + 1;
        match step {
            1 => {
                let counted = child_counted.clone();
                let mut child_step = 0;
                Some(YieldInstruction::nested(StepFn::new(move || {
                    child_step += 1;
                    counted.fetch_add(1, Ordering::SeqCst);
                    if child_step == 1 {
                        Some(YieldInstruction::at_phase(Phase::EndOfFrame))
                    } else {
                        None
                    }
                })))
            }
            2 => Some(YieldInstruction::at_phase(Phase::Update)),
            _ => None,
        }
    }));

    // Delegation starts synchronously: the child's first step ran at start.
    assert_eq!(parent_steps.load(Ordering::SeqCst), 1);
    assert_eq!(child_steps.load(Ordering::SeqCst), 1);

    // The child waits for end-of-frame; nothing moves on other phases.
    scheduler.on_update();
    scheduler.on_late_update();
    scheduler.on_fixed_update();
    assert_eq!(child_steps.load(Ordering::SeqCst), 1);

    // Child finishes during end-of-frame; the parent resumes in the same
    // advance and yields "resume at update".
    scheduler.on_end_of_frame();
    assert_eq!(child_steps.load(Ordering::SeqCst), 2);
    assert_eq!(parent_steps.load(Ordering::SeqCst), 2);

    // The parent must not run again until the next update, even though the
    // child finished during an unrelated phase.
    scheduler.on_late_update();
    scheduler.on_fixed_update();
    scheduler.on_end_of_frame();
    assert_eq!(parent_steps.load(Ordering::SeqCst), 2);

    scheduler.on_update();
    assert_eq!(parent_steps.load(Ordering::SeqCst), 3);
    assert!(handle.is_completed());

    scheduler.dispose();
}

#[test]
fn poll_advances_minimum_fraction_with_expired_budget() {
    let host = TestHost::new(false);
    // Zero budget: the deadline expires immediately, so only the
    // minimum-progress floor drives the drain.
    let scheduler = Scheduler::create(host, 0, 0.5).expect("valid scheduler config");

    let steps = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let counted = steps.clone();
        scheduler.start(StepFn::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Some(YieldInstruction::Poll)
        }));
    }
    // One step each at start.
    assert_eq!(steps.load(Ordering::SeqCst), 10);
    assert_eq!(scheduler.stats().pending_poll, 10);

    // ceil(10 * 0.5) = 5 routines advance despite the expired budget.
    scheduler.on_poll();
    assert_eq!(steps.load(Ordering::SeqCst), 15);

    scheduler.on_poll();
    assert_eq!(steps.load(Ordering::SeqCst), 20);

    scheduler.dispose();
}

#[test]
fn scaled_timer_fires_when_clock_crosses_threshold() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host.clone());

    let steps = Arc::new(AtomicUsize::new(0));
    let counted = steps.clone();
    let handle = scheduler.start_with_handle(StepFn::new(move || {
        let step = counted.fetch_add(1, Ordering::SeqCst) + 1;
        if step == 1 {
            Some(YieldInstruction::after_seconds(2.0))
        } else {
            None
        }
    }));
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    // 1.9s elapsed: below the threshold, repeated updates do nothing.
    host.clock.advance(1.9);
    for _ in 0..5 {
        scheduler.on_update();
    }
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    // 2.1s elapsed: the timer-draining phase advances it exactly once.
    host.clock.advance(0.2);
    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    assert!(handle.is_completed());

    scheduler.dispose();
}

#[test]
fn realtime_timer_uses_wall_clock() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host.clone());

    let steps = Arc::new(AtomicUsize::new(0));
    let counted = steps.clone();
    scheduler.start(StepFn::new(move || {
        let step = counted.fetch_add(1, Ordering::SeqCst) + 1;
        if step == 1 {
            Some(YieldInstruction::after_seconds_realtime(0.05))
        } else {
            None
        }
    }));

    // The scaled clock never moves; only wall time matters.
    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    thread::sleep(Duration::from_millis(80));
    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 2);

    scheduler.dispose();
}

#[test]
fn predicate_waits_resume_when_condition_flips() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host);

    let flag = Arc::new(AtomicBool::new(false));
    let steps = Arc::new(AtomicUsize::new(0));

    let watched = flag.clone();
    let counted = steps.clone();
    scheduler.start(StepFn::new(move || {
        let step = counted.fetch_add(1, Ordering::SeqCst) + 1;
        if step == 1 {
            let watched = watched.clone();
            Some(YieldInstruction::wait_until(move || {
                watched.load(Ordering::SeqCst)
            }))
        } else {
            None
        }
    }));

    scheduler.on_update();
    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    flag.store(true, Ordering::SeqCst);
    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 2);

    scheduler.dispose();
}

#[test]
fn sibling_wait_resumes_after_sibling_completes() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host);

    let mut sibling_done = false;
    let sibling = scheduler.start_with_handle(StepFn::new(move || {
        if sibling_done {
            return None;
        }
        sibling_done = true;
        Some(YieldInstruction::at_phase(Phase::LateUpdate))
    }));

    let steps = Arc::new(AtomicUsize::new(0));
    let counted = steps.clone();
    let waiter_sibling = sibling.clone();
    let waiter = scheduler.start_with_handle(StepFn::new(move || {
        let step = counted.fetch_add(1, Ordering::SeqCst) + 1;
        if step == 1 {
            Some(YieldInstruction::sibling(waiter_sibling.clone()))
        } else {
            None
        }
    }));

    // Sibling still pending: the waiter stays parked.
    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 1);
    assert!(!sibling.is_completed());

    // Sibling finishes on late update; the waiter resumes next update.
    scheduler.on_late_update();
    assert!(sibling.is_completed());
    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    assert!(waiter.is_completed());

    scheduler.dispose();
}

#[test]
fn faulted_external_dependency_abandons_waiter() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host.clone());

    let job = JobHandle::new();
    let steps = Arc::new(AtomicUsize::new(0));

    let counted = steps.clone();
    let awaited = job.clone();
    let handle = scheduler.start_with_handle(StepFn::new(move || {
        let step = counted.fetch_add(1, Ordering::SeqCst) + 1;
        if step == 1 {
            Some(YieldInstruction::external(awaited.clone()))
        } else {
            None
        }
    }));

    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    job.fail("solver exploded");
    scheduler.on_update();

    // Never resumed, but disposed: the handle completes so observers do not
    // hang, and the fault reaches the diagnostic channel.
    assert_eq!(steps.load(Ordering::SeqCst), 1);
    assert!(handle.is_completed());
    assert!(host
        .diagnostics()
        .contains(&Diagnostic::DependencyFailed("solver exploded".to_string())));

    scheduler.dispose();
}

#[test]
fn ready_external_dependency_resumes_waiter() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host);

    let job = JobHandle::new();
    let steps = Arc::new(AtomicUsize::new(0));

    let counted = steps.clone();
    let awaited = job.clone();
    scheduler.start(StepFn::new(move || {
        let step = counted.fetch_add(1, Ordering::SeqCst) + 1;
        if step == 1 {
            Some(YieldInstruction::external(awaited.clone()))
        } else {
            None
        }
    }));

    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 1);

    job.complete();
    scheduler.on_update();
    assert_eq!(steps.load(Ordering::SeqCst), 2);

    scheduler.dispose();
}

#[test]
fn background_round_trip_returns_to_host_thread() {
    let host = TestHost::new(true);
    let scheduler = scheduler_with(host);

    let host_thread = thread::current().id();
    let thread_log = Arc::new(Mutex::new(Vec::new()));

    let logged = thread_log.clone();
    let mut step = 0;
    let handle = scheduler.start_with_handle(StepFn::new(move || {
        step += 1;
        logged.lock().push(thread::current().id());
        match step {
            1 => Some(YieldInstruction::MoveToBackground),
            2 => Some(YieldInstruction::MoveToForeground),
            _ => None,
        }
    }));

    for _ in 0..400 {
        scheduler.on_update();
        if handle.is_completed() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(handle.is_completed());

    let log = thread_log.lock().clone();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0], host_thread, "first step runs inline on the host");
    assert_ne!(log[1], host_thread, "background step runs on a worker");
    assert_eq!(log[2], host_thread, "foreground step returns to the host");

    scheduler.dispose();
}

#[test]
fn threadsafe_start_runs_first_step_on_worker() {
    let host = TestHost::new(true);
    let scheduler = Arc::new(scheduler_with(host));

    let host_thread = thread::current().id();
    let thread_log = Arc::new(Mutex::new(Vec::new()));

    let handle = {
        let scheduler = scheduler.clone();
        let logged = thread_log.clone();
        thread::spawn(move || {
            let mut step = 0;
            scheduler.start_with_handle_threadsafe(
                StepFn::new(move || {
                    step += 1;
                    logged.lock().push(thread::current().id());
                    match step {
                        1 => Some(YieldInstruction::MoveToLongBackground),
                        2 => Some(YieldInstruction::MoveToForeground),
                        _ => None,
                    }
                }),
                PoolKind::Long,
            )
        })
        .join()
        .expect("spawn thread")
    };

    for _ in 0..400 {
        scheduler.on_update();
        if handle.is_completed() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(handle.is_completed());

    let log = thread_log.lock().clone();
    assert_eq!(log.len(), 3);
    assert_ne!(log[0], host_thread);
    assert_ne!(log[1], host_thread);
    assert_eq!(log[2], host_thread);

    scheduler.dispose();
}

#[test]
fn background_degrades_to_poll_without_worker_pool() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host.clone());

    let steps = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let counted = steps.clone();
        let mut migrated = false;
        scheduler.start(StepFn::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            if migrated {
                return None;
            }
            migrated = true;
            Some(YieldInstruction::MoveToBackground)
        }));
    }
    assert_eq!(steps.load(Ordering::SeqCst), 2);

    // Degraded routines land in the poll lane and still make progress.
    scheduler.on_poll();
    assert_eq!(steps.load(Ordering::SeqCst), 4);

    // The warning is reported exactly once.
    let warnings = host
        .diagnostics()
        .iter()
        .filter(|d| **d == Diagnostic::NoWorkerPool)
        .count();
    assert_eq!(warnings, 1);

    scheduler.dispose();
}

#[test]
fn internal_instruction_from_user_code_is_reported() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host.clone());

    let handle = scheduler.start_with_handle(StepFn::new(|| Some(YieldInstruction::Done)));

    // Treated as finished, best-effort, with a misuse diagnostic.
    assert!(handle.is_completed());
    assert!(host
        .diagnostics()
        .iter()
        .any(|d| matches!(d, Diagnostic::Misuse(msg) if msg.contains("Done"))));

    scheduler.dispose();
}

#[test]
fn dispose_reports_pending_external_waits() {
    let host = TestHost::new(false);
    let scheduler = scheduler_with(host.clone());

    let job = JobHandle::new();
    let awaited = job.clone();
    let mut started = false;
    scheduler.start(StepFn::new(move || {
        if started {
            return None;
        }
        started = true;
        Some(YieldInstruction::external(awaited.clone()))
    }));

    scheduler.on_update();
    scheduler.dispose();

    assert!(host
        .diagnostics()
        .contains(&Diagnostic::DisposedPending { external_waits: 1 }));
}
