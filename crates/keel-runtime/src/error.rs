use std::fmt;
use thiserror::Error;

/// Raised by [`crate::unsafe_execute_sync`] when a program that was
/// expected to complete without suspending actually suspended — the
/// escape hatch is only sound for effects that provably never touch
/// `Async`. The turn budget itself never raises an error: exceeding it
/// just makes the evaluator yield a turn via `scheduler.asap` and resume
/// on the next one, so there is no "exceeded the budget" failure mode to
/// report here — only a long-running effect's own outcome or a timeout
/// the caller applied at the effect level.
#[derive(Debug, Error)]
pub enum SyncExecError<E: fmt::Debug + fmt::Display> {
    #[error("effect did not settle within the scheduler's drained window; use `execute` instead")]
    StillPending,
    #[error("effect failed: {0}")]
    Failed(#[source] keel_types::Failure<E>),
}
