//! External awaitables: opaque "is this complete yet" polls
//!
//! The scheduler treats parallel-job handles, futures, and custom waiters
//! uniformly: it polls them once per update until they report `Ready` or
//! `Faulted`. A faulted dependency abandons the waiting routine (logged
//! through the host diagnostic channel, never resumed).

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

/// Result of polling an external awaitable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Keep waiting.
    Pending,
    /// The dependency completed; the waiter may resume.
    Ready,
    /// The dependency failed; the waiter is abandoned.
    Faulted(String),
}

/// An opaque external awaitable the scheduler can poll for completion.
pub trait Pollable: Send + 'static {
    /// Report the current completion state. Called once per relevant phase.
    fn poll_status(&mut self) -> PollStatus;
}

/// Completion handle for an external parallel job.
///
/// The job system clones the handle, performs the work, and calls
/// [`JobHandle::complete`] or [`JobHandle::fail`]; a routine yields the
/// other clone via `YieldInstruction::external`.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

struct JobInner {
    done: AtomicBool,
    fault: Mutex<Option<String>>,
}

impl JobHandle {
    /// Create a new, incomplete job handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JobInner {
                done: AtomicBool::new(false),
                fault: Mutex::new(None),
            }),
        }
    }

    /// Mark the job as successfully completed.
    pub fn complete(&self) {
        self.inner.done.store(true, Ordering::Release);
    }

    /// Mark the job as failed.
    pub fn fail(&self, message: impl Into<String>) {
        *self.inner.fault.lock() = Some(message.into());
        self.inner.done.store(true, Ordering::Release);
    }

    /// Whether the job has finished (successfully or not).
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Pollable for JobHandle {
    fn poll_status(&mut self) -> PollStatus {
        if !self.inner.done.load(Ordering::Acquire) {
            return PollStatus::Pending;
        }
        match self.inner.fault.lock().take() {
            Some(message) => PollStatus::Faulted(message),
            None => PollStatus::Ready,
        }
    }
}

/// Adapter turning a poll closure into a [`Pollable`].
pub struct PollFn<F> {
    poll: F,
}

impl<F> PollFn<F>
where
    F: FnMut() -> PollStatus + Send + 'static,
{
    /// Wrap a poll closure.
    pub fn new(poll: F) -> Self {
        Self { poll }
    }
}

impl<F> Pollable for PollFn<F>
where
    F: FnMut() -> PollStatus + Send + 'static,
{
    fn poll_status(&mut self) -> PollStatus {
        (self.poll)()
    }
}

/// Adapter that polls a future for completion, discarding its output.
///
/// The future is polled with a no-op waker: the scheduler re-polls every
/// update instead of waiting for a wake, which matches the "opaque
/// completion check" contract.
pub struct FutureDone<F> {
    future: Option<F>,
}

impl<F> FutureDone<F>
where
    F: Future + Send + Unpin + 'static,
{
    /// Wrap a future into a completion poll.
    pub fn new(future: F) -> Self {
        Self {
            future: Some(future),
        }
    }
}

impl<F> Pollable for FutureDone<F>
where
    F: Future + Send + Unpin + 'static,
{
    fn poll_status(&mut self) -> PollStatus {
        let Some(future) = self.future.as_mut() else {
            return PollStatus::Ready;
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match Pin::new(future).poll(&mut cx) {
            Poll::Ready(_) => {
                self.future = None;
                PollStatus::Ready
            }
            Poll::Pending => PollStatus::Pending,
        }
    }
}

fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable =
        RawWakerVTable::new(|_| RawWaker::new(std::ptr::null(), &VTABLE), |_| {}, |_| {}, |_| {});
    // Safety: the vtable functions are all no-ops over a null data pointer.
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}
