//! Pooled, generation-tagged completion handles
//!
//! Handles let external code observe "is this specific logical run done"
//! without keeping the run's memory alive. Slots are rented from a pool and
//! recycled across unrelated runs; the generation counter makes stale reads
//! safe: a caller holding an old generation observes the run as completed
//! (the slot was recycled, so the run it tagged is over), never a
//! use-after-free.

use parking_lot::Mutex;
use std::sync::Arc;

type Continuation = Box<dyn FnOnce() + Send>;

struct Slot {
    /// Bumped on every completion; callers capture the value at rent time.
    generation: u32,
    /// Whether the current rental has completed. Reset on rent.
    completed: bool,
    /// Continuations to fire on completion of the current rental.
    continuations: Vec<Continuation>,
}

struct PoolState {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Slot arena backing [`RoutineHandle`]s.
///
/// One pool per scheduler. Slots are never freed, only recycled.
pub struct HandlePool {
    state: Mutex<PoolState>,
}

impl HandlePool {
    /// Create an empty pool.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        })
    }

    /// Rent a slot for a new logical run.
    ///
    /// Returns the caller-facing handle and the single-use completer the
    /// routine wrapper owns.
    pub fn rent(self: &Arc<Self>) -> (RoutineHandle, HandleCompleter) {
        let mut state = self.state.lock();
        let index = match state.free.pop() {
            Some(index) => {
                let slot = &mut state.slots[index as usize];
                slot.completed = false;
                debug_assert!(slot.continuations.is_empty());
                index
            }
            None => {
                state.slots.push(Slot {
                    generation: 0,
                    completed: false,
                    continuations: Vec::new(),
                });
                (state.slots.len() - 1) as u32
            }
        };
        let generation = state.slots[index as usize].generation;
        drop(state);

        let handle = RoutineHandle {
            pool: Arc::clone(self),
            index,
            generation,
        };
        let completer = HandleCompleter {
            pool: Arc::clone(self),
            index,
            generation,
        };
        (handle, completer)
    }

    /// Number of slots currently rented out.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.slots.len() - state.free.len()
    }

    fn is_completed(&self, index: u32, generation: u32) -> bool {
        let state = self.state.lock();
        let slot = &state.slots[index as usize];
        slot.generation != generation || slot.completed
    }

    fn on_completed(&self, index: u32, generation: u32, continuation: Continuation) {
        {
            let mut state = self.state.lock();
            let slot = &mut state.slots[index as usize];
            if slot.generation == generation && !slot.completed {
                slot.continuations.push(continuation);
                return;
            }
        }
        // Already completed (or recycled): fire synchronously so callers
        // never wait on a run that is already over.
        continuation();
    }

    fn complete(&self, index: u32, generation: u32) {
        let continuations = {
            let mut state = self.state.lock();
            let slot = &mut state.slots[index as usize];
            if slot.generation != generation {
                // Completer outlived a recycle; nothing left to signal.
                return;
            }
            slot.completed = true;
            slot.generation = slot.generation.wrapping_add(1);
            state.free.push(index);
            std::mem::take(&mut state.slots[index as usize].continuations)
        };
        for continuation in continuations {
            continuation();
        }
    }
}

/// Caller-held observer of one logical run.
///
/// Holds `(pool, slot index, captured generation)`, never a reference into
/// the run itself. Cheap to clone; safe to keep long after the run and its
/// slot have been recycled.
#[derive(Clone)]
pub struct RoutineHandle {
    pool: Arc<HandlePool>,
    index: u32,
    generation: u32,
}

impl RoutineHandle {
    /// Whether the logical run this handle was rented for has completed.
    ///
    /// Monotone for a fixed handle: once `true`, always `true`.
    pub fn is_completed(&self) -> bool {
        self.pool.is_completed(self.index, self.generation)
    }

    /// Register a continuation to run when the run completes.
    ///
    /// If the run already completed (or the slot was recycled), the
    /// continuation runs synchronously before this returns.
    pub fn on_completed(&self, continuation: impl FnOnce() + Send + 'static) {
        self.pool
            .on_completed(self.index, self.generation, Box::new(continuation));
    }
}

impl std::fmt::Debug for RoutineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Single-use completion side of a rented slot.
///
/// Owned by the routine entry; consumed exactly once when the run finishes
/// or is disposed.
pub struct HandleCompleter {
    pool: Arc<HandlePool>,
    index: u32,
    generation: u32,
}

impl HandleCompleter {
    /// Fire continuations, invalidate the captured generation, and return
    /// the slot to the pool.
    pub fn complete(self) {
        self.pool.complete(self.index, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_completion_is_monotone() {
        let pool = HandlePool::new();
        let (handle, completer) = pool.rent();

        assert!(!handle.is_completed());
        completer.complete();
        assert!(handle.is_completed());
        assert!(handle.is_completed());
    }

    #[test]
    fn test_continuation_fires_once() {
        let pool = HandlePool::new();
        let (handle, completer) = pool.rent();

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        handle.on_completed(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        completer.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_continuation_runs_synchronously() {
        let pool = HandlePool::new();
        let (handle, completer) = pool.rent();
        completer.complete();

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        handle.on_completed(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_handle_observes_completion_after_recycle() {
        let pool = HandlePool::new();

        let (stale, completer) = pool.rent();
        completer.complete();

        // Recycle the same slot for an unrelated run.
        let (fresh, completer) = pool.rent();
        assert_eq!(stale.index, fresh.index);
        assert_ne!(stale.generation, fresh.generation);

        // The stale handle reports completion immediately; the fresh one
        // tracks the new run.
        assert!(stale.is_completed());
        assert!(!fresh.is_completed());

        completer.complete();
        assert!(fresh.is_completed());
    }

    #[test]
    fn test_outstanding_count() {
        let pool = HandlePool::new();
        assert_eq!(pool.outstanding(), 0);

        let (_h1, c1) = pool.rent();
        let (_h2, c2) = pool.rent();
        assert_eq!(pool.outstanding(), 2);

        c1.complete();
        assert_eq!(pool.outstanding(), 1);
        c2.complete();
        assert_eq!(pool.outstanding(), 0);
    }
}
