use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to a task queued on a [`Scheduler`].
///
/// Cancellation is a single atomic flag flip, amortized O(1): the flag is
/// owned by the token itself, not by the scheduler's queue, so a
/// [`Scheduler`] impl never needs to walk or mutate its run queue to honor
/// a cancellation — it only has to check the flag immediately before
/// invoking the queued closure. That check-then-skip is what makes
/// `cancel` idempotent and a safe no-op on a task that already ran.
#[derive(Clone)]
pub struct CancelToken {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the task as cancelled. Safe to call more than once, and safe to
    /// call after the task has already run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl PartialEq for CancelToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CancelToken {}

/// The scheduler contract every effect execution goes through.
///
/// All async suspension in the runtime is mediated by a `Scheduler`; no
/// direct platform timer access is permitted from effects built with the
/// public combinator API. Not publicly implementable outside this workspace
/// in spirit (the conventional "not intended to be publicly implemented"
/// note), but left as an open trait since the whole point of this contract
/// is that alternate schedulers (wall-clock, test) plug in underneath the
/// same evaluator.
pub trait Scheduler: Send + Sync {
    /// Schedule `task` to run in a subsequent logical turn — never
    /// synchronously within the caller's current turn.
    fn asap(&self, task: Box<dyn FnOnce() + Send>) -> CancelToken;

    /// Schedule `task` to run after `ms` logical milliseconds.
    fn delay(&self, task: Box<dyn FnOnce() + Send>, ms: u64) -> CancelToken;

    /// Current logical time in milliseconds.
    fn now(&self) -> u64;

    /// Cancel a previously scheduled task. Idempotent; a no-op if the task
    /// already ran. The default implementation is sufficient for every
    /// implementor because [`CancelToken`] owns its own cancelled flag.
    fn cancel(&self, token: &CancelToken) {
        token.cancel();
    }
}
