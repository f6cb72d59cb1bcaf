use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::Failure;
use crate::scheduler::{CancelToken, Scheduler};

/// A type-erased effect value, boxed once it crosses a continuation
/// boundary.
///
/// Rust's instruction tree is homogeneous in `R`/`E` but heterogeneous in
/// the value type carried at each node (a `Map` frame turns an `A` into a
/// `B`, a `Chain` frame turns an `A` into an `Effect<R, E, B>`). Without
/// GADTs there is no way to express "this enum's payload type depends on
/// which variant it is," so the value itself is erased to `AnyValue` here
/// and the typed `Effect<R, E, A>` facade in `effect.rs` is the only code
/// that ever boxes or downcasts it — every downcast is performed by the
/// exact combinator that produced the box, so the erasure is sound by
/// construction even though it isn't checked by the compiler at this layer.
pub type AnyValue = Box<dyn Any + Send>;

pub(crate) fn downcast<A: 'static>(v: AnyValue) -> A {
    *v.downcast::<A>().unwrap_or_else(|_| {
        panic!("keel-types: internal type erasure invariant violated (expected {})", std::any::type_name::<A>())
    })
}

/// Public re-export of the downcast used at the combinator layer, for
/// `keel_runtime`'s evaluator to convert a settled `AnyValue` back to the
/// concrete `A` the top-level `Effect<R, E, A>` promised.
pub fn downcast_any<A: 'static>(v: AnyValue) -> A {
    downcast(v)
}

pub(crate) fn upcast<A: Send + 'static>(v: A) -> AnyValue {
    Box::new(v)
}

pub(crate) fn downcast_ref<A: 'static>(v: &AnyValue) -> &A {
    v.downcast_ref::<A>().unwrap_or_else(|| {
        panic!("keel-types: internal type erasure invariant violated (expected {})", std::any::type_name::<A>())
    })
}

/// The erased result of a `Zip` node: both branches' values, still boxed
/// individually since the evaluator never learns their concrete types.
/// `Effect::zip` unpacks this back into a typed tuple immediately after
/// the `Zip` node settles.
pub struct Pair(pub AnyValue, pub AnyValue);

/// Callback invoked by an `Async` instruction's registration closure to
/// resolve the suspended effect, one way or the other. Mirrors the
/// register/resolve callback-pair idiom rather than `std::future::Future`,
/// since the instruction tree is driven by the trampoline, not by a waker.
pub type ResolveCb<E> = Box<dyn FnOnce(Result<AnyValue, Failure<E>>) + Send>;

/// A continuation closure applied to the erased value a prior instruction
/// produced. Used by `Map` (pure transform) and by `Chain`/`Catch` (produce
/// the next instruction to run).
pub type MapFn = Arc<dyn Fn(AnyValue) -> AnyValue + Send + Sync>;
pub type ChainFn<R, E> = Arc<dyn Fn(AnyValue) -> Arc<Instruction<R, E>> + Send + Sync>;
pub type CatchFn<R, E> = Arc<dyn Fn(Failure<E>) -> Arc<Instruction<R, E>> + Send + Sync>;

/// Clones an already-settled `Once` result. Built at `Effect::once`'s call
/// site, where the concrete success type is still known to be `Clone` —
/// by the time it reaches this erased boundary there is no trait bound left
/// to lean on, so the clone itself travels as a closure, the same trick
/// `ValueFactory`/`FailureFactory` use to manufacture a fresh terminal value
/// per run.
pub type CloneValue = Arc<dyn Fn(&AnyValue) -> AnyValue + Send + Sync>;
pub type CloneFailure<E> = Arc<dyn Fn(&Failure<E>) -> Failure<E> + Send + Sync>;

enum OnceSlot<E> {
    NotStarted,
    InFlight(Vec<Box<dyn FnOnce(Result<AnyValue, Failure<E>>) + Send>>),
    Done(Result<AnyValue, Failure<E>>),
}

/// What a caller joining a `Once` node should do next.
pub enum OnceJoin {
    /// First caller: run the wrapped instruction, then report the outcome
    /// through [`OnceCell::settle`].
    Start,
    /// Another caller already started the run; the waiter passed to
    /// [`OnceCell::join`] will fire once it settles.
    Joined,
    /// Already settled — fire this task (typically via `scheduler.asap`)
    /// to deliver the (cloned) cached result to the joining waiter.
    Ready(Box<dyn FnOnce() + Send>),
}

/// The shared memoization state backing `Effect::once`. Lives on the
/// `Instruction` tree rather than in `effect.rs` because only
/// `keel_runtime`'s evaluator can actually drive a composite (`Map`/
/// `Chain`/`Catch`/`Provide`/`Race`/`Zip`) instruction to completion; this
/// cell just tracks who has joined and what, if anything, has settled.
pub struct OnceCell<E> {
    slot: Mutex<OnceSlot<E>>,
    clone_value: CloneValue,
    clone_failure: CloneFailure<E>,
}

impl<E> OnceCell<E> {
    pub fn new(clone_value: CloneValue, clone_failure: CloneFailure<E>) -> Self {
        Self {
            slot: Mutex::new(OnceSlot::NotStarted),
            clone_value,
            clone_failure,
        }
    }

    fn clone_result(&self, result: &Result<AnyValue, Failure<E>>) -> Result<AnyValue, Failure<E>> {
        match result {
            Ok(v) => Ok((self.clone_value)(v)),
            Err(f) => Err((self.clone_failure)(f)),
        }
    }

    /// Registers `waiter` for this node's eventual outcome and reports
    /// whether the caller must actually run the wrapped instruction.
    pub fn join(&self, waiter: Box<dyn FnOnce(Result<AnyValue, Failure<E>>) + Send>) -> OnceJoin {
        let mut guard = self.slot.lock().unwrap();
        match &mut *guard {
            OnceSlot::Done(result) => {
                let cloned = self.clone_result(result);
                OnceJoin::Ready(Box::new(move || waiter(cloned)))
            }
            OnceSlot::InFlight(waiters) => {
                waiters.push(waiter);
                OnceJoin::Joined
            }
            OnceSlot::NotStarted => {
                *guard = OnceSlot::InFlight(vec![waiter]);
                OnceJoin::Start
            }
        }
    }

    /// Records the outcome of the run the `Start` caller performed and
    /// returns one delivery task per joined waiter (including that first
    /// caller), ready to be scheduled via `scheduler.asap`.
    pub fn settle(&self, result: Result<AnyValue, Failure<E>>) -> Vec<Box<dyn FnOnce() + Send>> {
        let mut guard = self.slot.lock().unwrap();
        let cached = self.clone_result(&result);
        let waiters = match std::mem::replace(&mut *guard, OnceSlot::Done(cached)) {
            OnceSlot::InFlight(waiters) => waiters,
            OnceSlot::NotStarted | OnceSlot::Done(_) => Vec::new(),
        };
        drop(guard);

        let mut tasks: Vec<Box<dyn FnOnce() + Send>> = Vec::with_capacity(waiters.len());
        let mut remaining = waiters.len();
        let mut result = Some(result);
        for waiter in waiters {
            remaining -= 1;
            if remaining == 0 {
                let result = result.take().expect("keel-types: once settle delivered its last copy twice");
                tasks.push(Box::new(move || waiter(result)));
            } else {
                let cloned = self.clone_result(result.as_ref().expect("keel-types: once settle result already taken"));
                tasks.push(Box::new(move || waiter(cloned)));
            }
        }
        tasks
    }
}

/// Factory for a terminal value. Instruction nodes are shared behind `Arc`
/// so that an `Effect` can be cloned and run more than once (referential
/// transparency); a plain embedded `A` could only be moved out
/// once, so `Constant`/`Reject` instead hold a closure that manufactures a
/// fresh value (or failure) on every execution. This mirrors how
/// `futures::future::Shared` requires `Output: Clone` to replay a value to
/// more than one subscriber.
pub type ValueFactory = Arc<dyn Fn() -> AnyValue + Send + Sync>;
pub type FailureFactory<E> = Arc<dyn Fn() -> Failure<E> + Send + Sync>;

/// The closed instruction algebra. Every `Effect<R, E, A>` is a
/// thin typed wrapper around `Arc<Instruction<R, E>>`; the value type `A`
/// lives only in the wrapper's `PhantomData`, never in this enum.
///
/// Two tags from the source algebra, `Resume` and `ResumeM`, have no
/// variant here: they describe "a value/instruction is ready for the
/// waiting continuation frame," which in this evaluator is a transient
/// state of the fiber's program counter (`keel_runtime`'s `Current` enum)
/// rather than a node in the persistent, `Arc`-shared tree. A tree node
/// can't itself hold a one-shot "ready" value without breaking the
/// multi-execution sharing every other node relies on, so the concept is
/// realized as the evaluator's internal dispatch state instead.
pub enum Instruction<R, E> {
    /// Produces a value synchronously, no suspension.
    Constant(ValueFactory),
    /// Fails synchronously with a typed error.
    Reject(FailureFactory<E>),
    /// Never completes. Used as the identity of `race` and for modeling
    /// effects that intentionally hang.
    Never,
    /// Reads the environment `R` itself as the produced value.
    Ask,
    /// Defers construction of the next instruction until execution time,
    /// so side effects in the builder closure happen once per run rather
    /// than once per `Effect` construction.
    Suspend(Arc<dyn Fn(&R) -> Arc<Instruction<R, E>> + Send + Sync>),
    /// Registers a callback-based asynchronous operation with the active
    /// `Scheduler`. `f` receives the environment, the scheduler driving
    /// this execution, and a `ResolveCb` it must invoke exactly once. The
    /// scheduler is handed over as an owned `Arc` (not a borrowed
    /// reference) so a registration that needs to schedule work from a
    /// callback firing well after `f` itself returns — a timer, a retry, a
    /// future's waker — can hold onto a handle past the single call.
    Async(Arc<dyn Fn(&R, &Arc<dyn Scheduler>, ResolveCb<E>) -> CancelToken + Send + Sync>),
    /// Runs `source`, then applies `f` to its successful value, staying on
    /// the erased-value boundary — never re-enters the scheduler.
    Map(Arc<Instruction<R, E>>, MapFn),
    /// Runs `source`, then uses its successful value to build and run the
    /// next instruction. This is the only variant that can sequence two
    /// suspensions.
    Chain(Arc<Instruction<R, E>>, ChainFn<R, E>),
    /// Runs `source`; on failure, uses the failure to build and run a
    /// recovery instruction instead of propagating it.
    Catch(Arc<Instruction<R, E>>, CatchFn<R, E>),
    /// Runs the inner instruction against a fixed environment, ignoring
    /// whatever `R` the surrounding program was executed with.
    /// Kept as one `R` throughout rather than two type
    /// parameters: the instruction tree is erased on value type already,
    /// and a node that could swap in an unrelated `R2` would need the same
    /// erasure on the environment, which buys nothing `encase`-style
    /// closures don't already give at the combinator layer.
    Provide(Arc<Instruction<R, E>>, Arc<R>),
    /// Runs both branches concurrently; settles with
    /// whichever branch finishes first, success or failure, and abandons
    /// the other. The evaluator, not this type, is responsible for
    /// actually interleaving the two sub-fibers — this node only records
    /// the intent.
    Race(Arc<Instruction<R, E>>, Arc<Instruction<R, E>>),
    /// Runs both branches concurrently; succeeds with
    /// both results once both have succeeded, or fails as soon as either
    /// branch fails.
    Zip(Arc<Instruction<R, E>>, Arc<Instruction<R, E>>),
    /// Runs `source` at most once, across however many times this node is
    /// itself executed or joined concurrently; every caller observes the
    /// same outcome. The evaluator drives `source` for whichever caller
    /// arrives first and replays the cached result to every other joiner.
    Once(Arc<Instruction<R, E>>, Arc<OnceCell<E>>),
}

impl<R, E> fmt::Debug for Instruction<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Instruction::Constant(_) => "Constant",
            Instruction::Reject(_) => "Reject",
            Instruction::Never => "Never",
            Instruction::Ask => "Ask",
            Instruction::Suspend(_) => "Suspend",
            Instruction::Async(_) => "Async",
            Instruction::Map(..) => "Map",
            Instruction::Chain(..) => "Chain",
            Instruction::Catch(..) => "Catch",
            Instruction::Provide(..) => "Provide",
            Instruction::Race(..) => "Race",
            Instruction::Zip(..) => "Zip",
            Instruction::Once(..) => "Once",
        };
        f.debug_tuple(tag).finish()
    }
}
