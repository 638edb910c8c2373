//! Top-level scheduler: shard registry and phase fan-out
//!
//! The scheduler maps each concrete (routine type, cancellation type) pair
//! to its `TypedShard`, created lazily on first use. Host tick callbacks fan
//! out to every registered shard; the poll callback additionally computes a
//! global deadline and minimum-progress quota before invoking each shard's
//! bounded drain.

use crate::background::{PoolKind, WorkerPool};
use crate::cancel::{CancelCheck, NeverCancel};
use crate::error::SchedulerError;
use crate::handle::{HandlePool, RoutineHandle};
use crate::host::{Diagnostic, Host};
use crate::instruction::Phase;
use crate::routine::Routine;
use crate::shard::{Entry, ShardOps, TypedShard};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// State shared between the scheduler, its shards, and background jobs.
pub(crate) struct SharedState {
    host: Arc<dyn Host>,
    pools: Option<PoolSet>,
    pub(crate) handles: Arc<HandlePool>,
    disposed: AtomicBool,
    no_pool_warned: AtomicBool,
    host_thread: ThreadId,
}

struct PoolSet {
    short: WorkerPool,
    long: WorkerPool,
}

impl SharedState {
    pub(crate) fn pool(&self, kind: PoolKind) -> Option<&WorkerPool> {
        self.pools.as_ref().map(|pools| match kind {
            PoolKind::Short => &pools.short,
            PoolKind::Long => &pools.long,
        })
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn scaled_time(&self) -> f64 {
        self.host.scaled_time()
    }

    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        self.host.report(diagnostic);
    }

    pub(crate) fn misuse(&self, message: impl Into<String>) {
        let message = message.into();
        #[cfg(debug_assertions)]
        eprintln!("tickweave misuse: {}", message);
        self.host.report(Diagnostic::Misuse(message));
    }

    pub(crate) fn warn_no_pool(&self) {
        if !self.no_pool_warned.swap(true, Ordering::AcqRel) {
            self.host.report(Diagnostic::NoWorkerPool);
        }
    }
}

/// Scheduler statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Number of distinct (routine type, cancellation type) shards.
    pub shards: usize,
    /// Routines currently queued in the poll lane across all shards.
    pub pending_poll: usize,
    /// Completion handles currently rented out.
    pub outstanding_handles: usize,
}

/// The top-level cooperative routine scheduler.
///
/// Create one per host, drive it from the host tick loop
/// (`on_update` → `on_poll` → `on_fixed_update` → `on_late_update` →
/// `on_end_of_frame`), and dispose it on shutdown.
pub struct Scheduler {
    shared: Arc<SharedState>,
    registry: RwLock<FxHashMap<(TypeId, TypeId), Arc<dyn ShardOps>>>,
    poll_budget: Duration,
    poll_min_progress: f32,
}

impl Scheduler {
    /// Create a scheduler for `host`.
    ///
    /// `poll_budget_ms` bounds the time spent per `on_poll` call;
    /// `poll_min_progress` (a fraction in `[0, 1]`) guarantees that at least
    /// that share of the pending poll queue is advanced even when the budget
    /// runs out first. Out-of-range fractions fail fast.
    pub fn create(
        host: Arc<dyn Host>,
        poll_budget_ms: u32,
        poll_min_progress: f32,
    ) -> Result<Self, SchedulerError> {
        if !poll_min_progress.is_finite() || !(0.0..=1.0).contains(&poll_min_progress) {
            return Err(SchedulerError::ProgressFractionOutOfRange(
                poll_min_progress,
            ));
        }

        let pools = if host.background_allowed() {
            Some(PoolSet {
                short: WorkerPool::new("tickweave-short", num_cpus::get().max(1)),
                long: WorkerPool::new("tickweave-long", 2),
            })
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(SharedState {
                host,
                pools,
                handles: HandlePool::new(),
                disposed: AtomicBool::new(false),
                no_pool_warned: AtomicBool::new(false),
                host_thread: thread::current().id(),
            }),
            registry: RwLock::new(FxHashMap::default()),
            poll_budget: Duration::from_millis(u64::from(poll_budget_ms)),
            poll_min_progress,
        })
    }

    /// Start a routine that runs until it finishes.
    ///
    /// The first step runs inline, on the caller's (host) thread.
    pub fn start<R: Routine>(&self, routine: R) {
        self.start_cancellable(routine, NeverCancel);
    }

    /// Start a routine with a cancellation check.
    pub fn start_cancellable<R: Routine, C: CancelCheck>(&self, routine: R, cancel: C) {
        if self.refuse_when_disposed("start") {
            return;
        }
        self.check_host_thread("start");
        self.shard::<R, C>()
            .start_entry(Entry::new(routine, cancel, None));
    }

    /// Start a routine and obtain a completion handle for it.
    pub fn start_with_handle<R: Routine>(&self, routine: R) -> RoutineHandle {
        self.start_cancellable_with_handle(routine, NeverCancel)
    }

    /// Start a routine with a cancellation check and a completion handle.
    pub fn start_cancellable_with_handle<R: Routine, C: CancelCheck>(
        &self,
        routine: R,
        cancel: C,
    ) -> RoutineHandle {
        let (handle, completer) = self.shared.handles.rent();
        if self.refuse_when_disposed("start_with_handle") {
            // Complete immediately so no caller waits on a run that will
            // never be scheduled.
            completer.complete();
            return handle;
        }
        self.check_host_thread("start_with_handle");
        self.shard::<R, C>()
            .start_entry(Entry::new(routine, cancel, Some(completer)));
        handle
    }

    /// Start a routine from any thread; the first step runs on the chosen
    /// worker pool.
    pub fn start_threadsafe<R: Routine>(&self, routine: R, kind: PoolKind) {
        self.start_cancellable_threadsafe(routine, NeverCancel, kind);
    }

    /// Thread-safe start with a cancellation check.
    pub fn start_cancellable_threadsafe<R: Routine, C: CancelCheck>(
        &self,
        routine: R,
        cancel: C,
        kind: PoolKind,
    ) {
        if self.refuse_when_disposed("start_threadsafe") {
            return;
        }
        self.shard::<R, C>()
            .start_entry_background(Entry::new(routine, cancel, None), kind);
    }

    /// Thread-safe start returning a completion handle.
    pub fn start_with_handle_threadsafe<R: Routine>(
        &self,
        routine: R,
        kind: PoolKind,
    ) -> RoutineHandle {
        self.start_cancellable_with_handle_threadsafe(routine, NeverCancel, kind)
    }

    /// Thread-safe start with a cancellation check and a completion handle.
    pub fn start_cancellable_with_handle_threadsafe<R: Routine, C: CancelCheck>(
        &self,
        routine: R,
        cancel: C,
        kind: PoolKind,
    ) -> RoutineHandle {
        let (handle, completer) = self.shared.handles.rent();
        if self.refuse_when_disposed("start_with_handle_threadsafe") {
            completer.complete();
            return handle;
        }
        self.shard::<R, C>()
            .start_entry_background(Entry::new(routine, cancel, Some(completer)), kind);
        handle
    }

    /// Resolve or lazily create the shard for `(R, C)`.
    fn shard<R: Routine, C: CancelCheck>(&self) -> Arc<TypedShard<R, C>> {
        let key = (TypeId::of::<R>(), TypeId::of::<C>());

        // Warm path: shared read lock.
        if let Some(shard) = self.registry.read().get(&key) {
            return downcast_shard::<R, C>(shard);
        }

        // Cold path: exclusive lock, once per distinct type pair.
        let mut registry = self.registry.write();
        let shard = registry
            .entry(key)
            .or_insert_with(|| TypedShard::<R, C>::create(self.shared.clone()) as Arc<dyn ShardOps>)
            .clone();
        drop(registry);
        downcast_shard::<R, C>(&shard)
    }

    /// Fire the `Update` phase. Also drains timer, predicate, external, and
    /// sibling waits.
    pub fn on_update(&self) {
        self.fan_out(Phase::Update);
    }

    /// Fire the `LateUpdate` phase.
    pub fn on_late_update(&self) {
        self.fan_out(Phase::LateUpdate);
    }

    /// Fire the `FixedUpdate` phase. May be called zero or more times per
    /// tick.
    pub fn on_fixed_update(&self) {
        self.fan_out(Phase::FixedUpdate);
    }

    /// Fire the `EndOfFrame` phase.
    pub fn on_end_of_frame(&self) {
        self.fan_out(Phase::EndOfFrame);
    }

    fn fan_out(&self, phase: Phase) {
        if self.refuse_when_disposed(phase.name()) {
            return;
        }
        self.check_host_thread(phase.name());
        // Collect first: advancing routines may start new ones, which takes
        // the registry lock.
        let shards: Vec<Arc<dyn ShardOps>> = self.registry.read().values().cloned().collect();
        for shard in shards {
            shard.on_phase(phase);
        }
    }

    /// Drain the poll lane under the configured time budget, advancing at
    /// least the configured fraction of the pending queue.
    pub fn on_poll(&self) {
        if self.refuse_when_disposed("poll") {
            return;
        }
        self.check_host_thread("poll");
        let shards: Vec<Arc<dyn ShardOps>> = self.registry.read().values().cloned().collect();

        let total: usize = shards.iter().map(|shard| shard.poll_len()).sum();
        if total == 0 {
            return;
        }

        // Monotonic deadline; per-shard quotas sum to at least
        // ceil(total * fraction).
        let deadline = Instant::now() + self.poll_budget;
        for shard in shards {
            let quota = ((shard.poll_len() as f32) * self.poll_min_progress).ceil() as usize;
            shard.on_poll(deadline, quota);
        }
    }

    /// Cancel and dispose every in-flight routine, drain background results,
    /// and stop the worker pools. Reported, never thrown: still-pending
    /// external waits go through the diagnostic channel.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            self.shared.misuse("scheduler disposed more than once");
            return;
        }

        // Stop workers first so no new results race the bucket drain.
        if let Some(pools) = &self.shared.pools {
            pools.short.stop();
            pools.long.stop();
        }

        let shards: Vec<Arc<dyn ShardOps>> = self.registry.read().values().cloned().collect();
        let mut pending_externals = 0;
        for shard in shards {
            pending_externals += shard.dispose_all();
        }
        if pending_externals > 0 {
            self.shared.report(Diagnostic::DisposedPending {
                external_waits: pending_externals,
            });
        }
    }

    /// Whether `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Snapshot of scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        let registry = self.registry.read();
        SchedulerStats {
            shards: registry.len(),
            pending_poll: registry.values().map(|shard| shard.poll_len()).sum(),
            outstanding_handles: self.shared.handles.outstanding(),
        }
    }

    fn refuse_when_disposed(&self, what: &str) -> bool {
        if self.shared.is_disposed() {
            self.shared
                .misuse(format!("{} called on a disposed scheduler", what));
            return true;
        }
        false
    }

    fn check_host_thread(&self, what: &str) {
        if thread::current().id() != self.shared.host_thread {
            self.shared.misuse(format!(
                "{} called off the host thread; use the threadsafe entry points",
                what
            ));
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.shared.is_disposed() {
            self.dispose();
        }
    }
}

fn downcast_shard<R: Routine, C: CancelCheck>(shard: &Arc<dyn ShardOps>) -> Arc<TypedShard<R, C>> {
    shard
        .as_any()
        .downcast_ref::<TypedShard<R, C>>()
        .expect("shard registry key/type mismatch")
        .arc()
}
