//! Background worker pools
//!
//! Routines that yield `MoveToBackground` / `MoveToLongBackground` re-enter
//! their advance loop on one of two pools: `Short` for latency-sensitive
//! fire-and-forget work, `Long` for long-running or bulk work. Workers pull
//! boxed jobs from a shared injector; a panicking job never takes its worker
//! thread down.

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Worker category for background migration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolKind {
    /// Short-lived, latency-sensitive work.
    Short,
    /// Long-running or bulk work.
    Long,
}

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads fed by a shared injector.
pub(crate) struct WorkerPool {
    injector: Arc<Injector<Job>>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` named threads draining the pool's injector.
    pub fn new(name: &'static str, workers: usize) -> Self {
        let injector = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || {
                    Self::run_loop(injector, shutdown);
                })
                .expect("failed to spawn background worker thread");
            handles.push(handle);
        }

        Self {
            injector,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Worker main loop: steal a job, run it, swallow panics.
    fn run_loop(injector: Arc<Injector<Job>>, shutdown: Arc<AtomicBool>) {
        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            match injector.steal() {
                Steal::Success(job) => {
                    // The job itself reports panics through the diagnostic
                    // channel; this is the last line of defense for the
                    // worker thread.
                    let _ = catch_unwind(AssertUnwindSafe(job));
                }
                Steal::Empty => {
                    // No work available; sleep briefly to avoid busy-waiting.
                    thread::sleep(Duration::from_micros(100));
                }
                Steal::Retry => {}
            }
        }
    }

    /// Enqueue a job for any worker in this pool.
    pub fn submit(&self, job: Job) {
        self.injector.push(job);
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Signal shutdown and join all workers. Queued jobs that no worker has
    /// picked up yet are dropped.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_pool_runs_jobs() {
        let pool = WorkerPool::new("tickweave-test", 2);
        assert_eq!(pool.worker_count(), 2);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Workers sleep 100us when idle, so this is plenty.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 8);

        pool.stop();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("tickweave-test-panic", 1);

        pool.submit(Box::new(|| {
            panic!("job panic");
        }));

        let ran = Arc::new(AtomicBool::new(false));
        let observed = ran.clone();
        pool.submit(Box::new(move || {
            observed.store(true, Ordering::SeqCst);
        }));

        thread::sleep(Duration::from_millis(100));
        assert!(ran.load(Ordering::SeqCst));

        pool.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = WorkerPool::new("tickweave-test-stop", 1);
        pool.stop();
        pool.stop();
        assert_eq!(pool.worker_count(), 0);
    }
}
