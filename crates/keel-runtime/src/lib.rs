mod error;
mod evaluator;
mod fiber;
pub mod scheduler;

pub use error::SyncExecError;
pub use evaluator::DEFAULT_TURN_BUDGET;
pub use scheduler::{TestScheduler, WallClockScheduler};

use std::fmt;
use std::sync::{Arc, Mutex};

use keel_types::instruction::downcast_any;
use keel_types::{CancelToken, Effect, Failure, Scheduler};

/// Runs `effect` against `env` and `scheduler`, using the default turn
/// budget, delivering the final result to `on_settle` exactly once.
/// Returns a [`CancelToken`] that abandons the whole fiber — including any
/// outstanding `Async` registration — if cancelled before it settles.
pub fn execute<R, E, A>(
    effect: Effect<R, E, A>,
    env: R,
    scheduler: Arc<dyn Scheduler>,
    on_settle: impl FnOnce(Result<A, Failure<E>>) + Send + 'static,
) -> CancelToken
where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
    A: Send + 'static,
{
    execute_with_budget(effect, env, scheduler, DEFAULT_TURN_BUDGET, on_settle)
}

/// As [`execute`], but with an explicit per-burst trampoline turn budget
/// instead of [`DEFAULT_TURN_BUDGET`].
pub fn execute_with_budget<R, E, A>(
    effect: Effect<R, E, A>,
    env: R,
    scheduler: Arc<dyn Scheduler>,
    turn_budget: u64,
    on_settle: impl FnOnce(Result<A, Failure<E>>) + Send + 'static,
) -> CancelToken
where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
    A: Send + 'static,
{
    let instr = effect.into_instruction();
    evaluator::run(
        instr,
        Arc::new(env),
        scheduler,
        turn_budget,
        Box::new(move |result| on_settle(result.map(downcast_any::<A>))),
    )
}

/// Runs `effect` to completion against a [`TestScheduler`] that is driven
/// by repeatedly draining and advancing its own logical clock, and returns
/// the result synchronously. Fails with [`SyncExecError::StillPending`] if
/// the effect is still suspended once `max_advance_ms` of logical time has
/// elapsed with nothing left to promote — this is a test convenience, not
/// a general-purpose blocking `run`, since real `Async` work backed by a
/// `WallClockScheduler` has no logical clock to fast-forward.
pub fn unsafe_execute_sync<R, E, A>(
    effect: Effect<R, E, A>,
    env: R,
    scheduler: &Arc<TestScheduler>,
    max_advance_ms: u64,
) -> Result<A, SyncExecError<E>>
where
    R: Clone + Send + Sync + 'static,
    E: fmt::Debug + fmt::Display + Send + Sync + 'static,
    A: Send + 'static,
{
    let settled: Arc<Mutex<Option<Result<A, Failure<E>>>>> = Arc::new(Mutex::new(None));
    let settled_writer = settled.clone();
    let scheduler_dyn: Arc<dyn Scheduler> = scheduler.clone();

    execute(effect, env, scheduler_dyn, move |result| {
        *settled_writer.lock().unwrap() = Some(result);
    });

    scheduler.drain();
    let mut waited = 0u64;
    while settled.lock().unwrap().is_none() && waited < max_advance_ms {
        let step = 1.min(max_advance_ms - waited);
        scheduler.advance(step);
        waited += step;
    }

    match settled.lock().unwrap().take() {
        None => Err(SyncExecError::StillPending),
        Some(Ok(value)) => Ok(value),
        Some(Err(failure)) => Err(SyncExecError::Failed(failure)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::Effect;

    #[test]
    fn executes_a_pure_effect_synchronously() {
        let scheduler = TestScheduler::new();
        let effect: Effect<(), String, i32> = Effect::of(1).map(|n| n + 41);
        let result = unsafe_execute_sync(effect, (), &scheduler, 0);
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn executes_a_delayed_effect_once_the_clock_advances() {
        let scheduler = TestScheduler::new();
        let effect: Effect<(), String, i32> = Effect::of(7).delay(50);
        let result = unsafe_execute_sync(effect, (), &scheduler, 100);
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn propagates_a_typed_failure() {
        let scheduler = TestScheduler::new();
        let effect: Effect<(), String, i32> = Effect::reject("boom".to_string());
        let result = unsafe_execute_sync(effect, (), &scheduler, 0);
        match result {
            Err(SyncExecError::Failed(failure)) => assert_eq!(failure.typed(), Some("boom".to_string())),
            other => panic!("expected a typed failure, got {other:?}"),
        }
    }

    #[test]
    fn still_pending_when_the_effect_never_settles() {
        let scheduler = TestScheduler::new();
        let effect: Effect<(), String, i32> = Effect::never();
        let result = unsafe_execute_sync(effect, (), &scheduler, 10);
        assert!(matches!(result, Err(SyncExecError::StillPending)));
    }
}
