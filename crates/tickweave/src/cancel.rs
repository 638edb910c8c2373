//! Cancellation checks
//!
//! Cancellation is polled, not interrupt-driven: the check runs before every
//! re-entry of a routine, so a cancelled routine is disposed the next time it
//! would otherwise be advanced. Latency is bounded by the time until the
//! routine's suspension condition is next inspected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Decides whether a routine should be disposed instead of advanced.
pub trait CancelCheck: Send + 'static {
    /// `true` once the routine should be cancelled. Must be monotone:
    /// once `true`, never `false` again.
    fn is_cancelled(&self) -> bool;
}

/// The no-cancellation policy. Zero-sized; routines run to completion.
#[derive(Debug, Copy, Clone, Default)]
pub struct NeverCancel;

impl CancelCheck for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Shared cancellation flag.
///
/// Clones observe the same flag; any clone may cancel. Safe to trip from any
/// thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a new, untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. All routines checking it are disposed at their next
    /// dispatch point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl CancelCheck for CancelToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Host-entity liveness, used as a cancellation predicate.
///
/// The host's entity model is external to the scheduler; this trait is the
/// only point of contact.
pub trait Liveness: Send + 'static {
    /// Whether the owning entity still exists.
    fn is_alive(&self) -> bool;
}

/// Cancels a routine when its owning host entity dies.
#[derive(Debug, Clone)]
pub struct LivenessCancel<L> {
    owner: L,
}

impl<L: Liveness> LivenessCancel<L> {
    /// Tie cancellation to `owner`'s liveness.
    pub fn new(owner: L) -> Self {
        Self { owner }
    }
}

impl<L: Liveness> CancelCheck for LivenessCancel<L> {
    fn is_cancelled(&self) -> bool {
        !self.owner.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_cancel() {
        assert!(!NeverCancel.is_cancelled());
    }

    #[test]
    fn test_token_clones_share_state() {
        let token = CancelToken::new();
        let check = token.clone();

        assert!(!check.is_cancelled());
        token.cancel();
        assert!(check.is_cancelled());
    }

    #[test]
    fn test_liveness_cancel() {
        struct Flag(Arc<AtomicBool>);
        impl Liveness for Flag {
            fn is_alive(&self) -> bool {
                self.0.load(Ordering::Acquire)
            }
        }

        let alive = Arc::new(AtomicBool::new(true));
        let check = LivenessCancel::new(Flag(alive.clone()));

        assert!(!check.is_cancelled());
        alive.store(false, Ordering::Release);
        assert!(check.is_cancelled());
    }
}
