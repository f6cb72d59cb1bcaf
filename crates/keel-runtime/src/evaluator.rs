use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use keel_types::instruction::{upcast, AnyValue, OnceJoin, Pair};
use keel_types::{CancelToken, Defect, Failure, Instruction, Scheduler};
use tracing::trace;

use crate::fiber::{Current, Fiber, Frame};

/// Trampoline turns budgeted per synchronous burst before the evaluator
/// yields back to the scheduler with `asap`, so a pathological chain of
/// purely-synchronous `Map`/`Chain` nodes can't starve the rest of the
/// scheduler's queue — the stack-safety guarantee extended to fairness.
/// 255 mirrors the call-depth guard a replay loop typically
/// allows before requiring a trampoline bounce.
pub const DEFAULT_TURN_BUDGET: u64 = 255;

type Settle<E> = Arc<Mutex<Option<Box<dyn FnOnce(Result<AnyValue, Failure<E>>) + Send>>>>;

/// Drives `instr` to completion, suspending on `Async` nodes through
/// `scheduler` and invoking `on_settle` exactly once with the final
/// erased result. Returns a [`CancelToken`] that abandons the whole fiber
/// if cancelled before it settles.
pub(crate) fn run<R, E>(
    instr: Arc<Instruction<R, E>>,
    env: Arc<R>,
    scheduler: Arc<dyn Scheduler>,
    turn_budget: u64,
    on_settle: Box<dyn FnOnce(Result<AnyValue, Failure<E>>) + Send>,
) -> CancelToken
where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let fiber = Arc::new(Mutex::new(Fiber::start(instr)));
    let cancel = CancelToken::new();
    drive(
        fiber,
        env,
        scheduler,
        turn_budget,
        Arc::new(Mutex::new(Some(on_settle))),
        cancel.clone(),
    );
    cancel
}

fn drive<R, E>(
    fiber: Arc<Mutex<Fiber<R, E>>>,
    env: Arc<R>,
    scheduler: Arc<dyn Scheduler>,
    turn_budget: u64,
    on_settle: Settle<E>,
    cancel: CancelToken,
) where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    if cancel.is_cancelled() {
        return;
    }
    let mut turns = 0u64;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        // `Async` needs the full driving context (to register a resume
        // callback that re-enters `drive`), so it is handled here rather
        // than inside the narrower `step` function.
        let is_async = matches!(
            &fiber.lock().unwrap().current,
            Current::Instr(i) if matches!(&**i, Instruction::Async(_))
        );
        if is_async {
            suspend_on_async(&fiber, &env, &scheduler, turn_budget, &on_settle, &cancel);
            return;
        }

        let is_race = matches!(
            &fiber.lock().unwrap().current,
            Current::Instr(i) if matches!(&**i, Instruction::Race(..))
        );
        if is_race {
            run_race(&fiber, &env, &scheduler, turn_budget, &on_settle, &cancel);
            return;
        }

        let is_zip = matches!(
            &fiber.lock().unwrap().current,
            Current::Instr(i) if matches!(&**i, Instruction::Zip(..))
        );
        if is_zip {
            run_zip(&fiber, &env, &scheduler, turn_budget, &on_settle, &cancel);
            return;
        }

        let is_provide = matches!(
            &fiber.lock().unwrap().current,
            Current::Instr(i) if matches!(&**i, Instruction::Provide(..))
        );
        if is_provide {
            run_provide(&fiber, &env, &scheduler, turn_budget, &on_settle, &cancel);
            return;
        }

        let is_once = matches!(
            &fiber.lock().unwrap().current,
            Current::Instr(i) if matches!(&**i, Instruction::Once(..))
        );
        if is_once {
            run_once(&fiber, &env, &scheduler, turn_budget, &on_settle, &cancel);
            return;
        }

        let mut guard = fiber.lock().unwrap();
        match step(&mut guard, &env) {
            StepOutcome::Continue => {
                turns += 1;
                if turns >= turn_budget {
                    drop(guard);
                    let fiber = fiber.clone();
                    let env = env.clone();
                    let scheduler_for_task = scheduler.clone();
                    let on_settle = on_settle.clone();
                    let cancel_for_task = cancel.clone();
                    scheduler.asap(Box::new(move || {
                        drive(
                            fiber,
                            env,
                            scheduler_for_task,
                            turn_budget,
                            on_settle,
                            cancel_for_task,
                        );
                    }));
                    return;
                }
            }
            StepOutcome::Suspended => {
                return;
            }
            StepOutcome::Done(result) => {
                drop(guard);
                if let Some(cb) = on_settle.lock().unwrap().take() {
                    cb(result);
                }
                return;
            }
        }
    }
}

fn suspend_on_async<R, E>(
    fiber: &Arc<Mutex<Fiber<R, E>>>,
    env: &Arc<R>,
    scheduler: &Arc<dyn Scheduler>,
    turn_budget: u64,
    on_settle: &Settle<E>,
    cancel: &CancelToken,
) where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let register = {
        let guard = fiber.lock().unwrap();
        match &guard.current {
            Current::Instr(instr) => match &**instr {
                Instruction::Async(register) => register.clone(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    };
    trace!("keel_runtime: registering Async node with scheduler");

    let fiber_r = fiber.clone();
    let env_r = env.clone();
    let scheduler_r = scheduler.clone();
    let on_settle_r = on_settle.clone();
    let cancel_r = cancel.clone();
    let resolve = Box::new(move |result: Result<AnyValue, Failure<E>>| {
        if cancel_r.is_cancelled() {
            return;
        }
        {
            let mut guard = fiber_r.lock().unwrap();
            guard.current = match result {
                Ok(v) => Current::Value(v),
                Err(e) => Current::Failure(e),
            };
        }
        drive(fiber_r, env_r, scheduler_r, turn_budget, on_settle_r, cancel_r);
    });

    match panic::catch_unwind(AssertUnwindSafe(|| register(env, scheduler, resolve))) {
        Ok(token) => {
            fiber.lock().unwrap().current = Current::Suspended(token);
        }
        Err(payload) => {
            // `resolve` was moved into `register`; if it panicked before
            // calling it, the callback is gone along with the unwind, so
            // the failure has to be delivered directly instead.
            let mut guard = fiber.lock().unwrap();
            guard.current = Current::Failure(Failure::Defect(Defect::from_panic_payload(payload)));
            drop(guard);
            drive(fiber.clone(), env.clone(), scheduler.clone(), turn_budget, on_settle.clone(), cancel.clone());
        }
    }
}

/// Drives both branches of a `Race` concurrently by recursively invoking
/// `run`; whichever settles first is delivered to the fiber, and the
/// loser's own cancel token is cancelled so any scheduler entry it left
/// behind becomes a no-op — cancellation stays cooperative.
fn run_race<R, E>(
    fiber: &Arc<Mutex<Fiber<R, E>>>,
    env: &Arc<R>,
    scheduler: &Arc<dyn Scheduler>,
    turn_budget: u64,
    on_settle: &Settle<E>,
    cancel: &CancelToken,
) where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let (a, b) = {
        let guard = fiber.lock().unwrap();
        match &guard.current {
            Current::Instr(instr) => match &**instr {
                Instruction::Race(a, b) => (a.clone(), b.clone()),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    };

    let tokens: Arc<Mutex<Option<(CancelToken, CancelToken)>>> = Arc::new(Mutex::new(None));
    let settled = Arc::new(Mutex::new(false));

    let make_branch_settle = {
        let fiber = fiber.clone();
        let env = env.clone();
        let scheduler = scheduler.clone();
        let on_settle = on_settle.clone();
        let cancel = cancel.clone();
        let settled = settled.clone();
        let tokens = tokens.clone();
        move |is_a: bool| {
            let fiber = fiber.clone();
            let env = env.clone();
            let scheduler = scheduler.clone();
            let turn_budget = turn_budget;
            let on_settle = on_settle.clone();
            let cancel = cancel.clone();
            let settled = settled.clone();
            let tokens = tokens.clone();
            move |result: Result<AnyValue, Failure<E>>| {
                let mut settled_guard = settled.lock().unwrap();
                if *settled_guard {
                    return;
                }
                *settled_guard = true;
                drop(settled_guard);
                if let Some((tok_a, tok_b)) = tokens.lock().unwrap().as_ref() {
                    if is_a {
                        tok_b.cancel();
                    } else {
                        tok_a.cancel();
                    }
                }
                let mut guard = fiber.lock().unwrap();
                guard.current = match result {
                    Ok(v) => Current::Value(v),
                    Err(e) => Current::Failure(e),
                };
                drop(guard);
                drive(fiber, env, scheduler, turn_budget, on_settle, cancel);
            }
        }
    };

    let settle_a = make_branch_settle(true);
    let settle_b = make_branch_settle(false);
    let tok_a = run(a, env.clone(), scheduler.clone(), turn_budget, Box::new(settle_a));
    let tok_b = run(b, env.clone(), scheduler.clone(), turn_budget, Box::new(settle_b));
    *tokens.lock().unwrap() = Some((tok_a, tok_b));
}

/// Drives both branches of a `Zip` concurrently; succeeds with a `Pair`
/// once both sides have, or fails as soon as either side does.
fn run_zip<R, E>(
    fiber: &Arc<Mutex<Fiber<R, E>>>,
    env: &Arc<R>,
    scheduler: &Arc<dyn Scheduler>,
    turn_budget: u64,
    on_settle: &Settle<E>,
    cancel: &CancelToken,
) where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let (a, b) = {
        let guard = fiber.lock().unwrap();
        match &guard.current {
            Current::Instr(instr) => match &**instr {
                Instruction::Zip(a, b) => (a.clone(), b.clone()),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    };

    enum Slot {
        Empty,
        Value(AnyValue),
        Failed,
    }
    let slots: Arc<Mutex<(Slot, Slot)>> = Arc::new(Mutex::new((Slot::Empty, Slot::Empty)));

    let finish = {
        let fiber = fiber.clone();
        let env = env.clone();
        let scheduler = scheduler.clone();
        let on_settle = on_settle.clone();
        let cancel = cancel.clone();
        move |result: Result<AnyValue, Failure<E>>| {
            let mut guard = fiber.lock().unwrap();
            guard.current = match result {
                Ok(v) => Current::Value(v),
                Err(e) => Current::Failure(e),
            };
            drop(guard);
            drive(fiber.clone(), env.clone(), scheduler.clone(), turn_budget, on_settle.clone(), cancel.clone());
        }
    };

    let on_a = {
        let slots = slots.clone();
        let finish = finish.clone();
        move |result: Result<AnyValue, Failure<E>>| match result {
            Ok(v) => {
                let mut guard = slots.lock().unwrap();
                guard.0 = Slot::Value(v);
                if let (Slot::Value(_), Slot::Value(_)) = (&guard.0, &guard.1) {
                    let a = std::mem::replace(&mut guard.0, Slot::Failed);
                    let b = std::mem::replace(&mut guard.1, Slot::Failed);
                    drop(guard);
                    if let (Slot::Value(a), Slot::Value(b)) = (a, b) {
                        finish(Ok(upcast(Pair(a, b))));
                    }
                }
            }
            Err(e) => {
                let mut guard = slots.lock().unwrap();
                guard.0 = Slot::Failed;
                drop(guard);
                finish(Err(e));
            }
        }
    };
    let on_b = {
        let slots = slots.clone();
        let finish = finish.clone();
        move |result: Result<AnyValue, Failure<E>>| match result {
            Ok(v) => {
                let mut guard = slots.lock().unwrap();
                guard.1 = Slot::Value(v);
                if let (Slot::Value(_), Slot::Value(_)) = (&guard.0, &guard.1) {
                    let a = std::mem::replace(&mut guard.0, Slot::Failed);
                    let b = std::mem::replace(&mut guard.1, Slot::Failed);
                    drop(guard);
                    if let (Slot::Value(a), Slot::Value(b)) = (a, b) {
                        finish(Ok(upcast(Pair(a, b))));
                    }
                }
            }
            Err(e) => {
                let mut guard = slots.lock().unwrap();
                guard.1 = Slot::Failed;
                drop(guard);
                finish(Err(e));
            }
        }
    };

    run(a, env.clone(), scheduler.clone(), turn_budget, Box::new(on_a));
    run(b, env.clone(), scheduler.clone(), turn_budget, Box::new(on_b));
}

/// Runs the inner instruction of a `Provide` node as a nested fiber against
/// its fixed environment, then delivers the result back into the
/// surrounding fiber, which resumes under its own, original `env`.
fn run_provide<R, E>(
    fiber: &Arc<Mutex<Fiber<R, E>>>,
    outer_env: &Arc<R>,
    scheduler: &Arc<dyn Scheduler>,
    turn_budget: u64,
    on_settle: &Settle<E>,
    cancel: &CancelToken,
) where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let (inner, fixed_env) = {
        let guard = fiber.lock().unwrap();
        match &guard.current {
            Current::Instr(instr) => match &**instr {
                Instruction::Provide(inner, fixed_env) => (inner.clone(), fixed_env.clone()),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    };

    let fiber = fiber.clone();
    let outer_env = outer_env.clone();
    let scheduler = scheduler.clone();
    let on_settle = on_settle.clone();
    let cancel = cancel.clone();
    let settle_scheduler = scheduler.clone();
    let settle = Box::new(move |result: Result<AnyValue, Failure<E>>| {
        let mut guard = fiber.lock().unwrap();
        guard.current = match result {
            Ok(v) => Current::Value(v),
            Err(e) => Current::Failure(e),
        };
        drop(guard);
        drive(fiber, outer_env, settle_scheduler, turn_budget, on_settle, cancel);
    });

    run(inner, fixed_env, scheduler, turn_budget, settle);
}

/// Drives a `Once` node: the first caller to join actually runs `inner`
/// (recursively, however deep it is — `Map`/`Chain`/`Catch`/`Provide`/
/// `Race`/`Zip`, all the way down); every other joiner, concurrent or
/// later, is delivered the same cached outcome instead of re-running
/// anything. Deliveries always go through `scheduler.asap`, matching
/// `Await`'s rule that a settling call never resumes a waiter inline.
fn run_once<R, E>(
    fiber: &Arc<Mutex<Fiber<R, E>>>,
    env: &Arc<R>,
    scheduler: &Arc<dyn Scheduler>,
    turn_budget: u64,
    on_settle: &Settle<E>,
    cancel: &CancelToken,
) where
    R: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let (inner, cell) = {
        let guard = fiber.lock().unwrap();
        match &guard.current {
            Current::Instr(instr) => match &**instr {
                Instruction::Once(inner, cell) => (inner.clone(), cell.clone()),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    };

    let deliver = {
        let fiber = fiber.clone();
        let env = env.clone();
        let scheduler = scheduler.clone();
        let on_settle = on_settle.clone();
        let cancel = cancel.clone();
        Box::new(move |result: Result<AnyValue, Failure<E>>| {
            let mut guard = fiber.lock().unwrap();
            guard.current = match result {
                Ok(v) => Current::Value(v),
                Err(e) => Current::Failure(e),
            };
            drop(guard);
            drive(fiber, env, scheduler, turn_budget, on_settle, cancel);
        })
    };

    match cell.join(deliver) {
        OnceJoin::Ready(task) => scheduler.asap(task),
        OnceJoin::Joined => CancelToken::new(),
        OnceJoin::Start => {
            let cell = cell.clone();
            let scheduler_for_settle = scheduler.clone();
            let settle_cb = Box::new(move |result: Result<AnyValue, Failure<E>>| {
                for task in cell.settle(result) {
                    scheduler_for_settle.asap(task);
                }
            });
            run(inner, env.clone(), scheduler.clone(), turn_budget, settle_cb)
        }
    };
}

enum StepOutcome<E> {
    Continue,
    Suspended,
    Done(Result<AnyValue, Failure<E>>),
}

/// Executes exactly one synchronous trampoline turn: either evaluates the
/// instruction currently in `Current::Instr`, or delivers a pending
/// `Value`/`Failure` to the top frame. Never recurses — every path
/// returns immediately, leaving the fiber in a state the next call can
/// pick up, which is what keeps arbitrarily long chains stack-safe.
/// `Async`/`Race`/`Zip` are intercepted by `drive` before this is called,
/// since they need the wider driving context.
fn step<R, E>(fiber: &mut Fiber<R, E>, env: &Arc<R>) -> StepOutcome<E>
where
    R: Clone + Send + Sync + 'static,
{
    let current = std::mem::replace(&mut fiber.current, Current::Done(Ok(Box::new(()))));
    match current {
        Current::Instr(instr) => eval_instr(fiber, instr, env),
        Current::Value(value) => deliver_value(fiber, value),
        Current::Failure(failure) => deliver_failure(fiber, failure),
        Current::Done(result) => StepOutcome::Done(result),
        Current::Suspended(token) => {
            fiber.current = Current::Suspended(token);
            StepOutcome::Suspended
        }
    }
}

fn eval_instr<R, E>(fiber: &mut Fiber<R, E>, instr: Arc<Instruction<R, E>>, env: &Arc<R>) -> StepOutcome<E>
where
    R: Clone + Send + Sync + 'static,
{
    match &*instr {
        Instruction::Constant(make) => {
            fiber.current = Current::Value(make());
            StepOutcome::Continue
        }
        Instruction::Reject(make) => {
            fiber.current = Current::Failure(make());
            StepOutcome::Continue
        }
        Instruction::Never => {
            fiber.current = Current::Suspended(keel_types::CancelToken::new());
            StepOutcome::Suspended
        }
        Instruction::Ask => {
            fiber.current = Current::Value(Box::new((**env).clone()));
            StepOutcome::Continue
        }
        Instruction::Suspend(build) => {
            fiber.current = Current::Instr(build(env));
            StepOutcome::Continue
        }
        Instruction::Async(_) | Instruction::Race(..) | Instruction::Zip(..) => {
            unreachable!("keel_runtime: handled by `drive` before reaching `step`")
        }
        Instruction::Map(source, f) => {
            fiber.frames.push(Frame::Map(f.clone()));
            fiber.current = Current::Instr(source.clone());
            StepOutcome::Continue
        }
        Instruction::Chain(source, f) => {
            fiber.frames.push(Frame::Chain(f.clone()));
            fiber.current = Current::Instr(source.clone());
            StepOutcome::Continue
        }
        Instruction::Catch(source, f) => {
            fiber.frames.push(Frame::Catch(f.clone()));
            fiber.current = Current::Instr(source.clone());
            StepOutcome::Continue
        }
        Instruction::Provide(..) | Instruction::Once(..) => {
            unreachable!("keel_runtime: handled by `drive` before reaching `step`")
        }
    }
}

fn deliver_value<R, E>(fiber: &mut Fiber<R, E>, value: AnyValue) -> StepOutcome<E> {
    match fiber.frames.pop() {
        None => StepOutcome::Done(Ok(value)),
        Some(Frame::Map(f)) => match panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
            Ok(value) => {
                fiber.current = Current::Value(value);
                StepOutcome::Continue
            }
            Err(payload) => {
                fiber.current = Current::Failure(Failure::Defect(Defect::from_panic_payload(payload)));
                StepOutcome::Continue
            }
        },
        Some(Frame::Chain(f)) => match panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
            Ok(instr) => {
                fiber.current = Current::Instr(instr);
                StepOutcome::Continue
            }
            Err(payload) => {
                fiber.current = Current::Failure(Failure::Defect(Defect::from_panic_payload(payload)));
                StepOutcome::Continue
            }
        },
        Some(Frame::Catch(_)) => {
            fiber.current = Current::Value(value);
            StepOutcome::Continue
        }
    }
}

fn deliver_failure<R, E>(fiber: &mut Fiber<R, E>, failure: Failure<E>) -> StepOutcome<E> {
    loop {
        match fiber.frames.pop() {
            None => return StepOutcome::Done(Err(failure)),
            Some(Frame::Catch(f)) => {
                return match panic::catch_unwind(AssertUnwindSafe(|| f(failure))) {
                    Ok(instr) => {
                        fiber.current = Current::Instr(instr);
                        StepOutcome::Continue
                    }
                    Err(payload) => {
                        fiber.current = Current::Failure(Failure::Defect(Defect::from_panic_payload(payload)));
                        StepOutcome::Continue
                    }
                };
            }
            Some(Frame::Map(_)) | Some(Frame::Chain(_)) => continue,
        }
    }
}
