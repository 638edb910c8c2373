//! Per-type dispatch shards
//!
//! A `TypedShard<R, C>` owns every wait bucket for one concrete
//! (routine type, cancellation type) pair: per-phase lists, timer heaps,
//! predicate / external / sibling wait lists, the poll queue, and the
//! concurrent ingestion surfaces background threads feed. The advance loop
//! pops a resumed routine, re-enters it, and re-files it into the bucket
//! named by its new yield instruction.
//!
//! Host-thread buckets are only ever mutated from the host thread; the
//! `SegQueue` overflow bags and the background return queue are the
//! multi-producer handoff surfaces, merged at the start of each drain.

use crate::background::PoolKind;
use crate::cancel::CancelCheck;
use crate::handle::{HandleCompleter, RoutineHandle};
use crate::host::Diagnostic;
use crate::instruction::{Phase, Predicate, YieldInstruction};
use crate::pollable::{PollStatus, Pollable};
use crate::routine::Routine;
use crate::scheduler::SharedState;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// A routine plus its cancellation check and delegation state.
///
/// Owned exclusively by whichever bucket currently holds it. The children
/// stack is the explicit composite for nested delegation: the deepest child
/// is stepped until it finishes, then its parent resumes within the same
/// advance call, so the parent's next instruction decides the next bucket.
pub(crate) struct Entry<R: Routine, C: CancelCheck> {
    routine: R,
    cancel: C,
    children: Vec<Box<dyn Routine>>,
    completer: Option<HandleCompleter>,
    disposed: bool,
}

impl<R: Routine, C: CancelCheck> Entry<R, C> {
    pub(crate) fn new(routine: R, cancel: C, completer: Option<HandleCompleter>) -> Self {
        Self {
            routine,
            cancel,
            children: Vec::new(),
            completer,
            disposed: false,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn has_child(&self) -> bool {
        !self.children.is_empty()
    }

    fn push_child(&mut self, child: Box<dyn Routine>) {
        self.children.push(child);
    }

    fn pop_child(&mut self) {
        if let Some(mut child) = self.children.pop() {
            child.dispose();
        }
    }

    /// Step the deepest active child, or the routine itself.
    fn step_top(&mut self, concurrent: bool) -> Option<YieldInstruction> {
        match self.children.last_mut() {
            Some(child) => {
                if concurrent {
                    child.step_concurrent()
                } else {
                    child.step()
                }
            }
            None => {
                if concurrent {
                    self.routine.step_concurrent()
                } else {
                    self.routine.step()
                }
            }
        }
    }

    /// Dispose children (deepest first), the routine, and complete the
    /// handle. Idempotent; also runs from `Drop` so an entry dropped on any
    /// path still signals its observers.
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        while let Some(mut child) = self.children.pop() {
            child.dispose();
        }
        self.routine.dispose();
        if let Some(completer) = self.completer.take() {
            completer.complete();
        }
    }
}

impl<R: Routine, C: CancelCheck> Drop for Entry<R, C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Scaled-clock timer heap entry. Reverse ordering for a min-heap; `seq`
/// keeps FIFO order among equal deadlines.
struct ScaledSleep<R: Routine, C: CancelCheck> {
    due: f64,
    seq: u64,
    entry: Entry<R, C>,
}

impl<R: Routine, C: CancelCheck> Ord for ScaledSleep<R, C> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .total_cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<R: Routine, C: CancelCheck> PartialOrd for ScaledSleep<R, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: Routine, C: CancelCheck> PartialEq for ScaledSleep<R, C> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<R: Routine, C: CancelCheck> Eq for ScaledSleep<R, C> {}

/// Wall-clock timer heap entry.
struct RealtimeSleep<R: Routine, C: CancelCheck> {
    due: Instant,
    seq: u64,
    entry: Entry<R, C>,
}

impl<R: Routine, C: CancelCheck> Ord for RealtimeSleep<R, C> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<R: Routine, C: CancelCheck> PartialOrd for RealtimeSleep<R, C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: Routine, C: CancelCheck> PartialEq for RealtimeSleep<R, C> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<R: Routine, C: CancelCheck> Eq for RealtimeSleep<R, C> {}

struct PredicateWait<R: Routine, C: CancelCheck> {
    pred: Predicate,
    /// Resume once the predicate returns this value.
    resume_when: bool,
    entry: Entry<R, C>,
}

struct ExternalWait<R: Routine, C: CancelCheck> {
    pollable: Box<dyn Pollable>,
    entry: Entry<R, C>,
}

struct SiblingWait<R: Routine, C: CancelCheck> {
    handle: RoutineHandle,
    entry: Entry<R, C>,
}

/// Host-thread-only buckets. Never touched by background threads.
struct Buckets<R: Routine, C: CancelCheck> {
    phases: [Vec<Entry<R, C>>; Phase::COUNT],
    scaled_sleeps: BinaryHeap<ScaledSleep<R, C>>,
    realtime_sleeps: BinaryHeap<RealtimeSleep<R, C>>,
    predicates: Vec<PredicateWait<R, C>>,
    externals: Vec<ExternalWait<R, C>>,
    siblings: Vec<SiblingWait<R, C>>,
    poll: VecDeque<Entry<R, C>>,
    seq: u64,
}

impl<R: Routine, C: CancelCheck> Buckets<R, C> {
    fn new() -> Self {
        Self {
            phases: Default::default(),
            scaled_sleeps: BinaryHeap::new(),
            realtime_sleeps: BinaryHeap::new(),
            predicates: Vec::new(),
            externals: Vec::new(),
            siblings: Vec::new(),
            poll: VecDeque::new(),
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Type-erased shard interface held by the scheduler registry.
pub(crate) trait ShardOps: Send + Sync {
    fn on_phase(&self, phase: Phase);
    fn on_poll(&self, deadline: Instant, min_quota: usize) -> usize;
    fn poll_len(&self) -> usize;
    /// Dispose every held entry; returns the number of external-dependency
    /// waits that were still pending.
    fn dispose_all(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

/// Dispatch unit for one concrete (routine type, cancellation type) pair.
pub(crate) struct TypedShard<R: Routine, C: CancelCheck> {
    self_ref: Weak<TypedShard<R, C>>,
    shared: Arc<SharedState>,
    host: Mutex<Buckets<R, C>>,
    phase_overflow: [SegQueue<Entry<R, C>>; Phase::COUNT],
    poll_overflow: SegQueue<Entry<R, C>>,
    /// Background-to-host handoff: `(entry, pending instruction)` pairs
    /// filed on the host thread at the start of the next drain.
    returns: SegQueue<(Entry<R, C>, YieldInstruction)>,
}

impl<R: Routine, C: CancelCheck> TypedShard<R, C> {
    pub(crate) fn create(shared: Arc<SharedState>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            shared,
            host: Mutex::new(Buckets::new()),
            phase_overflow: [
                SegQueue::new(),
                SegQueue::new(),
                SegQueue::new(),
                SegQueue::new(),
            ],
            poll_overflow: SegQueue::new(),
            returns: SegQueue::new(),
        })
    }

    pub(crate) fn arc(&self) -> Arc<Self> {
        // The registry holds the shard for the scheduler's lifetime, so the
        // upgrade cannot fail while any code path can reach us.
        self.self_ref.upgrade().expect("shard detached from registry")
    }

    /// Host-thread start: the first step runs inline.
    pub(crate) fn start_entry(&self, entry: Entry<R, C>) {
        self.advance(entry);
    }

    /// Any-thread start: the first step runs on the chosen worker pool.
    pub(crate) fn start_entry_background(&self, entry: Entry<R, C>, kind: PoolKind) {
        self.to_background(entry, kind);
    }

    /// Re-enter a routine on the host thread and file it by its new
    /// instruction.
    fn advance(&self, mut entry: Entry<R, C>) {
        loop {
            if self.shared.is_disposed() || entry.is_cancelled() {
                entry.dispose();
                return;
            }
            let had_child = entry.has_child();
            match entry.step_top(false) {
                None => {
                    if had_child {
                        // Child finished; the parent resumes in this same
                        // advance and its next instruction picks the bucket.
                        entry.pop_child();
                        continue;
                    }
                    entry.dispose();
                    return;
                }
                Some(YieldInstruction::ResumeOnNested(child)) => {
                    entry.push_child(child);
                }
                Some(YieldInstruction::Done) => {
                    self.shared
                        .misuse("routine yielded internal instruction Done");
                    if had_child {
                        entry.pop_child();
                        continue;
                    }
                    entry.dispose();
                    return;
                }
                Some(YieldInstruction::Parked) => {
                    self.shared
                        .misuse("routine yielded internal instruction Parked");
                    self.file(entry, YieldInstruction::Poll);
                    return;
                }
                Some(instruction) => {
                    self.file(entry, instruction);
                    return;
                }
            }
        }
    }

    /// Background-thread advance: concurrent stepping, panic capture, and
    /// handoff back to the host through the return queue.
    fn advance_concurrent(&self, mut entry: Entry<R, C>) {
        loop {
            if self.shared.is_disposed() || entry.is_cancelled() {
                entry.dispose();
                return;
            }
            let had_child = entry.has_child();
            let stepped = catch_unwind(AssertUnwindSafe(|| entry.step_top(true)));
            let instruction = match stepped {
                Ok(instruction) => instruction,
                Err(payload) => {
                    self.shared
                        .report(Diagnostic::BackgroundPanic(panic_message(&payload)));
                    entry.dispose();
                    return;
                }
            };
            match instruction {
                None => {
                    if had_child {
                        entry.pop_child();
                        continue;
                    }
                    entry.dispose();
                    return;
                }
                Some(YieldInstruction::ResumeOnNested(child)) => {
                    entry.push_child(child);
                }
                Some(YieldInstruction::MoveToBackground) => {
                    self.to_background(entry, PoolKind::Short);
                    return;
                }
                Some(YieldInstruction::MoveToLongBackground) => {
                    self.to_background(entry, PoolKind::Long);
                    return;
                }
                Some(YieldInstruction::Done) => {
                    self.shared
                        .misuse("routine yielded internal instruction Done");
                    if had_child {
                        entry.pop_child();
                        continue;
                    }
                    entry.dispose();
                    return;
                }
                Some(YieldInstruction::Parked) => {
                    self.shared
                        .misuse("routine yielded internal instruction Parked");
                    self.returns.push((entry, YieldInstruction::Poll));
                    return;
                }
                Some(instruction) => {
                    self.returns.push((entry, instruction));
                    return;
                }
            }
        }
    }

    /// File a suspended routine into the bucket its instruction names.
    /// Host thread only.
    fn file(&self, mut entry: Entry<R, C>, instruction: YieldInstruction) {
        match instruction {
            YieldInstruction::ResumeAtPhase(phase) => {
                self.host.lock().phases[phase.index()].push(entry);
            }
            YieldInstruction::ResumeAfter(duration) => {
                let due = self.shared.scaled_time() + duration.as_secs_f64();
                let mut buckets = self.host.lock();
                let seq = buckets.next_seq();
                buckets.scaled_sleeps.push(ScaledSleep { due, seq, entry });
            }
            YieldInstruction::ResumeAfterRealtime(duration) => {
                let due = Instant::now() + duration;
                let mut buckets = self.host.lock();
                let seq = buckets.next_seq();
                buckets
                    .realtime_sleeps
                    .push(RealtimeSleep { due, seq, entry });
            }
            YieldInstruction::ResumeWhile(pred) => {
                self.host.lock().predicates.push(PredicateWait {
                    pred,
                    resume_when: false,
                    entry,
                });
            }
            YieldInstruction::ResumeUntil(pred) => {
                self.host.lock().predicates.push(PredicateWait {
                    pred,
                    resume_when: true,
                    entry,
                });
            }
            YieldInstruction::ResumeOnExternal(pollable) => {
                self.host.lock().externals.push(ExternalWait { pollable, entry });
            }
            YieldInstruction::ResumeOnSibling(handle) => {
                self.host.lock().siblings.push(SiblingWait { handle, entry });
            }
            YieldInstruction::Poll => {
                self.host.lock().poll.push_back(entry);
            }
            YieldInstruction::MoveToBackground => {
                self.to_background(entry, PoolKind::Short);
            }
            YieldInstruction::MoveToLongBackground => {
                self.to_background(entry, PoolKind::Long);
            }
            YieldInstruction::MoveToForeground => {
                // Already on the host thread; resume with the next update.
                self.host.lock().phases[Phase::Update.index()].push(entry);
            }
            YieldInstruction::ResumeOnNested(child) => {
                // Normally intercepted by the advance loop; reachable only
                // through the return queue. Start the child on the next poll.
                entry.push_child(child);
                self.host.lock().poll.push_back(entry);
            }
            YieldInstruction::Done | YieldInstruction::Parked => {
                entry.dispose();
            }
        }
    }

    /// Hand a routine to a worker pool, or degrade to the poll lane on a
    /// single-threaded host.
    fn to_background(&self, entry: Entry<R, C>, kind: PoolKind) {
        let Some(pool) = self.shared.pool(kind) else {
            self.shared.warn_no_pool();
            self.poll_overflow.push(entry);
            return;
        };
        let shard = self.arc();
        pool.submit(Box::new(move || shard.advance_concurrent(entry)));
    }

    /// File everything background threads handed back since the last drain.
    fn drain_returns(&self) {
        while let Some((mut entry, instruction)) = self.returns.pop() {
            if entry.is_cancelled() {
                entry.dispose();
                continue;
            }
            self.file(entry, instruction);
        }
    }

    fn phase_drain(&self, phase: Phase) {
        self.drain_returns();
        let index = phase.index();
        let ready = {
            let mut buckets = self.host.lock();
            while let Some(entry) = self.phase_overflow[index].pop() {
                buckets.phases[index].push(entry);
            }
            std::mem::take(&mut buckets.phases[index])
        };
        for mut entry in ready {
            // Defensive re-check before re-entry; advance checks again.
            if entry.is_cancelled() {
                entry.dispose();
                continue;
            }
            self.advance(entry);
        }
        // Routines added by background threads during the drain.
        while let Some(entry) = self.phase_overflow[index].pop() {
            self.advance(entry);
        }

        if phase == Phase::Update {
            self.drain_scaled_timers();
            self.drain_realtime_timers();
            self.drain_predicates();
            self.drain_externals();
            self.drain_siblings();
        }
    }

    fn drain_scaled_timers(&self) {
        let now = self.shared.scaled_time();
        loop {
            let due = {
                let mut buckets = self.host.lock();
                match buckets.scaled_sleeps.peek() {
                    Some(sleep) if sleep.due <= now => {
                        buckets.scaled_sleeps.pop().map(|sleep| sleep.entry)
                    }
                    _ => None,
                }
            };
            match due {
                Some(entry) => self.advance(entry),
                None => break,
            }
        }
    }

    fn drain_realtime_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut buckets = self.host.lock();
                match buckets.realtime_sleeps.peek() {
                    Some(sleep) if sleep.due <= now => {
                        buckets.realtime_sleeps.pop().map(|sleep| sleep.entry)
                    }
                    _ => None,
                }
            };
            match due {
                Some(entry) => self.advance(entry),
                None => break,
            }
        }
    }

    fn drain_predicates(&self) {
        let waits = std::mem::take(&mut self.host.lock().predicates);
        let mut kept = Vec::with_capacity(waits.len());
        for mut wait in waits {
            if wait.entry.is_cancelled() {
                wait.entry.dispose();
                continue;
            }
            if (wait.pred)() == wait.resume_when {
                self.advance(wait.entry);
            } else {
                kept.push(wait);
            }
        }
        self.host.lock().predicates.extend(kept);
    }

    fn drain_externals(&self) {
        let waits = std::mem::take(&mut self.host.lock().externals);
        let mut kept = Vec::with_capacity(waits.len());
        for mut wait in waits {
            if wait.entry.is_cancelled() {
                wait.entry.dispose();
                continue;
            }
            match wait.pollable.poll_status() {
                PollStatus::Pending => kept.push(wait),
                PollStatus::Ready => self.advance(wait.entry),
                PollStatus::Faulted(message) => {
                    // Abandon the waiter: there is no continuation value to
                    // resume into.
                    self.shared.report(Diagnostic::DependencyFailed(message));
                    wait.entry.dispose();
                }
            }
        }
        self.host.lock().externals.extend(kept);
    }

    fn drain_siblings(&self) {
        let waits = std::mem::take(&mut self.host.lock().siblings);
        let mut kept = Vec::with_capacity(waits.len());
        for mut wait in waits {
            if wait.entry.is_cancelled() {
                wait.entry.dispose();
                continue;
            }
            if wait.handle.is_completed() {
                self.advance(wait.entry);
            } else {
                kept.push(wait);
            }
        }
        self.host.lock().siblings.extend(kept);
    }

    /// Bounded poll drain: stops once `min_quota` routines were advanced and
    /// the deadline has passed, or when the queue empties.
    fn poll_drain(&self, deadline: Instant, min_quota: usize) -> usize {
        self.drain_returns();
        {
            let mut buckets = self.host.lock();
            while let Some(entry) = self.poll_overflow.pop() {
                buckets.poll.push_back(entry);
            }
        }

        let mut advanced = 0;
        loop {
            let entry = self.host.lock().poll.pop_front();
            let Some(mut entry) = entry else { break };
            if entry.is_cancelled() {
                entry.dispose();
                continue;
            }
            self.advance(entry);
            advanced += 1;
            if advanced >= min_quota && Instant::now() >= deadline {
                break;
            }
        }
        advanced
    }

    fn pending_poll(&self) -> usize {
        self.host.lock().poll.len() + self.poll_overflow.len()
    }

    fn shutdown_drain(&self) -> usize {
        while let Some((mut entry, _)) = self.returns.pop() {
            entry.dispose();
        }
        for queue in &self.phase_overflow {
            while let Some(mut entry) = queue.pop() {
                entry.dispose();
            }
        }
        while let Some(mut entry) = self.poll_overflow.pop() {
            entry.dispose();
        }

        let (mut entries, pending_externals) = {
            let mut buckets = self.host.lock();
            let mut entries: Vec<Entry<R, C>> = Vec::new();
            for list in &mut buckets.phases {
                entries.append(list);
            }
            entries.extend(buckets.scaled_sleeps.drain().map(|sleep| sleep.entry));
            entries.extend(buckets.realtime_sleeps.drain().map(|sleep| sleep.entry));
            entries.extend(buckets.predicates.drain(..).map(|wait| wait.entry));
            let pending = buckets.externals.len();
            entries.extend(buckets.externals.drain(..).map(|wait| wait.entry));
            entries.extend(buckets.siblings.drain(..).map(|wait| wait.entry));
            entries.extend(buckets.poll.drain(..));
            (entries, pending)
        };
        // Dispose outside the bucket lock: completions may run arbitrary
        // continuations.
        for entry in &mut entries {
            entry.dispose();
        }
        pending_externals
    }
}

impl<R: Routine, C: CancelCheck> ShardOps for TypedShard<R, C> {
    fn on_phase(&self, phase: Phase) {
        self.phase_drain(phase);
    }

    fn on_poll(&self, deadline: Instant, min_quota: usize) -> usize {
        self.poll_drain(deadline, min_quota)
    }

    fn poll_len(&self) -> usize {
        self.pending_poll()
    }

    fn dispose_all(&self) -> usize {
        self.shutdown_drain()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
