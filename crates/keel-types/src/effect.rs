use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::error::{Defect, Failure};
use crate::instruction::{downcast, downcast_ref, upcast, AnyValue, CloneFailure, CloneValue, Instruction, OnceCell, ResolveCb};
use crate::scheduler::{CancelToken, Scheduler};

/// A pure, lazy, typed description of a computation that needs environment
/// `R`, may fail with `E`, and otherwise produces `A`.
///
/// Building an `Effect` never runs anything; only `keel_runtime::execute`
/// interprets the tree. Cloning an `Effect` is cheap (an `Arc` bump) and
/// re-running a cloned value re-executes the whole tree from scratch —
/// this is the referential transparency the whole algebra is built around.
pub struct Effect<R, E, A> {
    pub(crate) instr: Arc<Instruction<R, E>>,
    pub(crate) _value: PhantomData<fn() -> A>,
}

impl<R, E, A> Clone for Effect<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            instr: self.instr.clone(),
            _value: PhantomData,
        }
    }
}

impl<R, E, A> Effect<R, E, A> {
    pub(crate) fn from_instr(instr: Instruction<R, E>) -> Self {
        Self {
            instr: Arc::new(instr),
            _value: PhantomData,
        }
    }

    pub(crate) fn from_arc(instr: Arc<Instruction<R, E>>) -> Self {
        Self {
            instr,
            _value: PhantomData,
        }
    }

    /// Exposes the underlying instruction tree. Public so `keel_runtime`'s
    /// evaluator can drive it; not meant for use outside this workspace's
    /// own runtime crate, which is why it carries no combinator-level
    /// ergonomics of its own.
    pub fn into_instruction(self) -> Arc<Instruction<R, E>> {
        self.instr
    }
}

/// Catches a synchronous panic raised inside a user closure and turns it
/// into a [`Defect`]. `AssertUnwindSafe` is sound here because
/// the closures this wraps only touch owned or `Arc`-shared data that the
/// evaluator never observes again after a panic unwinds past it.
pub(crate) fn guard<F, T>(f: F) -> Result<T, Defect>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic_payload)
}

impl<R, E, A> Effect<R, E, A>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    /// Succeeds with `value` every time the effect is run.
    pub fn of(value: A) -> Self
    where
        A: Clone + Send + Sync,
    {
        Self::from_instr(Instruction::Constant(Arc::new(move || {
            upcast(value.clone())
        })))
    }

    /// Fails with `error` every time the effect is run.
    pub fn reject(error: E) -> Self
    where
        E: Clone + Send + Sync,
    {
        Self::from_instr(Instruction::Reject(Arc::new(move || {
            Failure::Typed(error.clone())
        })))
    }

    /// Never completes.
    pub fn never() -> Self {
        Self::from_instr(Instruction::Never)
    }

    /// Reads the environment.
    pub fn ask() -> Effect<R, E, R>
    where
        R: Clone + Send + Sync,
    {
        Effect::from_instr(Instruction::Ask)
    }

    /// Defers building the effect until execution time; `f` runs once per
    /// execution, not once per construction.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn(&R) -> Effect<R, E, A> + Send + Sync + 'static,
    {
        Self::from_instr(Instruction::Suspend(Arc::new(move |r| f(r).instr)))
    }

    /// Wraps a fallible, panic-prone synchronous closure. A returned `Err`
    /// becomes a typed failure; a panic becomes a defect.
    pub fn encase<F>(f: F) -> Self
    where
        F: Fn(&R) -> Result<A, E> + Send + Sync + 'static,
        A: Send,
    {
        Self::from_instr(Instruction::Suspend(Arc::new(move |r| {
            let instr = match guard(|| f(r)) {
                Ok(Ok(value)) => Instruction::Constant({
                    let value = Arc::new(std::sync::Mutex::new(Some(value)));
                    Arc::new(move || {
                        upcast(value.lock().unwrap().take().expect(
                            "keel-types: encase constant forced more than once",
                        ))
                    })
                }),
                Ok(Err(e)) => {
                    let e = Arc::new(std::sync::Mutex::new(Some(e)));
                    Instruction::Reject(Arc::new(move || {
                        Failure::Typed(e.lock().unwrap().take().expect(
                            "keel-types: encase reject forced more than once",
                        ))
                    }))
                }
                Err(defect) => Instruction::Reject(Arc::new(move || Failure::Defect(defect.clone()))),
            };
            Arc::new(instr)
        })))
    }

    /// Wraps a callback-style asynchronous operation: `register` is handed
    /// the environment, the driving scheduler, and a `ResolveCb` it must
    /// invoke exactly once, and returns a [`CancelToken`] the scheduler can
    /// use to cancel the outstanding work.
    pub fn from_register<F>(register: F) -> Self
    where
        F: Fn(&R, &Arc<dyn Scheduler>, ResolveCb<E>) -> CancelToken + Send + Sync + 'static,
    {
        Self::from_instr(Instruction::Async(Arc::new(register)))
    }

    /// Wraps any `Future<Output = Result<A, E>>` as an effect: `make` is
    /// called once per run to produce the future, which is then polled to
    /// completion via a waker that schedules the next poll with
    /// `scheduler.asap` rather than touching a platform reactor. This is
    /// the effect-system side of spec.md §6's "Promise → effect" contract,
    /// targeting `Future` as the nearest native Rust equivalent of the
    /// original's `Promise`.
    pub fn encase_p<F, Fut>(make: F) -> Self
    where
        F: Fn(&R) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, E>> + Send + 'static,
        A: Send,
        E: Send,
    {
        Self::from_register(move |r, sched, resolve| {
            let fut: Pin<Box<dyn Future<Output = Result<A, E>> + Send>> = Box::pin(make(r));
            poll_future(fut, sched.clone(), resolve)
        })
    }

    /// Transforms the success value. Runs entirely on the erased-value
    /// boundary, never suspends on its own.
    pub fn map<B, F>(self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
        B: Send + 'static,
    {
        Effect::from_instr(Instruction::Map(
            self.instr,
            Arc::new(move |v| upcast(f(downcast::<A>(v)))),
        ))
    }

    /// Sequences a dependent effect: `f` receives the success value and
    /// produces the next effect to run.
    pub fn chain<B, F>(self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
        B: 'static,
    {
        Effect::from_instr(Instruction::Chain(
            self.instr,
            Arc::new(move |v| f(downcast::<A>(v)).instr),
        ))
    }

    /// Recovers from a failure by producing a replacement effect.
    pub fn catch<F>(self, f: F) -> Self
    where
        F: Fn(Failure<E>) -> Effect<R, E, A> + Send + Sync + 'static,
    {
        Effect::from_instr(Instruction::Catch(
            self.instr,
            Arc::new(move |failure| f(failure).instr),
        ))
    }

    /// Supplies the environment an inner effect built against `R2` expects,
    /// letting it run inside an outer `R`-shaped program.
    pub fn provide(self, env: R) -> Self {
        Self::from_instr(Instruction::Provide(self.instr, Arc::new(env)))
    }

    /// Delays running the effect by `ms` logical milliseconds, via the
    /// scheduler driving execution rather than a platform sleep.
    pub fn delay(self, ms: u64) -> Self {
        sleep(ms).chain(move |_: ()| Effect::from_arc(self.instr.clone()))
    }

    /// Fails with `on_timeout` if the effect has not completed within `ms`
    /// logical milliseconds; otherwise yields the effect's own result. The
    /// loser of the race is abandoned by the evaluator once the winner
    /// settles — cancellation stays cooperative.
    pub fn timeout(self, ms: u64, on_timeout: E) -> Self
    where
        E: Clone + Send + Sync,
        A: Send,
    {
        self.race(sleep(ms).chain(move |_: ()| Effect::reject(on_timeout.clone())))
    }

    /// Runs both effects concurrently; resolves with whichever settles
    /// first, success or failure. Actually interleaving
    /// the two branches is the evaluator's job (`keel_runtime`); this just
    /// records the intent as a `Race` node.
    pub fn race(self, other: Self) -> Self {
        Self::from_instr(Instruction::Race(self.instr, other.instr))
    }

    /// Runs both effects concurrently and succeeds with both results once
    /// both have succeeded; fails as soon as either fails.
    /// The `Zip` node itself only knows it is combining two erased
    /// branches (`Pair`); unpacking that back into a typed `(A, B)` happens
    /// here, where the concrete types are still in scope.
    pub fn zip<B>(self, other: Effect<R, E, B>) -> Effect<R, E, (A, B)>
    where
        B: Send + 'static,
    {
        Effect::from_instr(Instruction::Map(
            Arc::new(Instruction::Zip(self.instr, other.instr)),
            Arc::new(|paired: AnyValue| {
                let crate::instruction::Pair(a, b) = downcast::<crate::instruction::Pair>(paired);
                upcast((downcast::<A>(a), downcast::<B>(b)))
            }),
        ))
    }

    /// Memoizes the outcome of the first execution and replays it to every
    /// subsequent execution of the returned effect, whether the original
    /// succeeded or failed — resolved Open Question: a failed run is cached
    /// too (not retried), the same way a settled `Promise` never re-runs its
    /// executor. Concurrent first callers (two executions racing to be
    /// "first") all share the single underlying run rather than each
    /// triggering their own — including when the wrapped effect is itself a
    /// composite (`map`/`chain`/`catch`/`provide`/`race`/`zip`, not just a
    /// leaf), since driving it to completion is delegated to whatever
    /// evaluator actually runs the returned `Once` node rather than
    /// reimplemented here. `A`/`E` are known concretely at this call site,
    /// before the value crosses into the erased `Instruction` boundary, so
    /// the clone closures baked into the `OnceCell` are just `A::clone()`/
    /// `E::clone()` under the erasure.
    pub fn once(self) -> Self
    where
        A: Clone + Send + Sync,
        E: Clone + Send + Sync,
    {
        let clone_value: CloneValue = Arc::new(|v: &AnyValue| upcast(downcast_ref::<A>(v).clone()));
        let clone_failure: CloneFailure<E> = Arc::new(|f: &Failure<E>| f.clone());
        let cell = Arc::new(OnceCell::new(clone_value, clone_failure));
        Self::from_instr(Instruction::Once(self.instr, cell))
    }
}

fn sleep<R, E>(ms: u64) -> Effect<R, E, ()>
where
    R: 'static,
    E: 'static,
{
    Effect::from_instr(Instruction::Async(Arc::new(move |_r, sched, resolve| {
        sched.delay(Box::new(move || resolve(Ok(upcast(())))), ms)
    })))
}

/// Shared state behind one `encase_p` poll loop: the future itself (taken
/// once it completes), the scheduler driving re-polls, and the evaluator's
/// resolve callback (taken once, on completion).
struct PollTask<A, E> {
    fut: Mutex<Option<Pin<Box<dyn Future<Output = Result<A, E>> + Send>>>>,
    sched: Arc<dyn Scheduler>,
    resolve: Mutex<Option<ResolveCb<E>>>,
    cancel: CancelToken,
}

impl<A, E> Wake for PollTask<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let task = self.clone();
        self.sched.asap(Box::new(move || drive_poll(task)));
    }
}

fn poll_future<A, E>(
    fut: Pin<Box<dyn Future<Output = Result<A, E>> + Send>>,
    sched: Arc<dyn Scheduler>,
    resolve: ResolveCb<E>,
) -> CancelToken
where
    A: Send + 'static,
    E: Send + 'static,
{
    let cancel = CancelToken::new();
    let task = Arc::new(PollTask {
        fut: Mutex::new(Some(fut)),
        sched,
        resolve: Mutex::new(Some(resolve)),
        cancel: cancel.clone(),
    });
    drive_poll(task);
    cancel
}

/// Polls the future exactly once. A panic inside `poll` becomes a defect,
/// same as any other user closure; a `Poll::Pending` just returns, leaving
/// the next `wake` (scheduled via `scheduler.asap`) to poll again.
fn drive_poll<A, E>(task: Arc<PollTask<A, E>>)
where
    A: Send + 'static,
    E: Send + 'static,
{
    if task.cancel.is_cancelled() {
        return;
    }
    let waker = Waker::from(task.clone());
    let polled = {
        let mut state = task.fut.lock().unwrap();
        match state.as_mut() {
            Some(fut) => {
                let mut cx = Context::from_waker(&waker);
                guard(|| fut.as_mut().poll(&mut cx))
            }
            None => return,
        }
    };
    match polled {
        Ok(Poll::Pending) => {}
        Ok(Poll::Ready(result)) => {
            *task.fut.lock().unwrap() = None;
            if let Some(resolve) = task.resolve.lock().unwrap().take() {
                resolve(result.map(upcast).map_err(Failure::Typed));
            }
        }
        Err(defect) => {
            *task.fut.lock().unwrap() = None;
            if let Some(resolve) = task.resolve.lock().unwrap().take() {
                resolve(Err(Failure::Defect(defect)));
            }
        }
    }
}
