use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::effect::Effect;
use crate::error::Failure;
use crate::instruction::upcast;
use crate::scheduler::CancelToken;

/// A mutable cell accessed only through effects. `Ref` itself
/// is cheap to clone — every clone shares the same underlying cell — so
/// passing one into a closure captured by several fibers is the idiomatic
/// way to share state between them, the same way an `Arc<Mutex<_>>` handle
/// is passed into spawned tasks rather than sharing a raw reference.
pub struct Ref<A> {
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<A> Ref<A>
where
    A: Clone + Send + Sync + 'static,
{
    pub fn new(initial: A) -> Self {
        Self {
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    /// Reads the current value as an effect.
    pub fn get<R, E>(&self) -> Effect<R, E, A>
    where
        R: 'static,
        E: 'static,
    {
        let cell = self.cell.clone();
        Effect::encase(move |_r: &R| Ok(cell.lock().unwrap().clone()))
    }

    /// Replaces the value unconditionally.
    pub fn set<R, E>(&self, value: A) -> Effect<R, E, ()>
    where
        R: 'static,
        E: 'static,
    {
        let cell = self.cell.clone();
        Effect::encase(move |_r: &R| {
            *cell.lock().unwrap() = value.clone();
            Ok(())
        })
    }

    /// Atomically replaces the value with `f(old)` and returns the new
    /// value — the building block `queue.rs`/counters use for
    /// read-modify-write without racing other fibers on the same `Ref`.
    pub fn update<R, E, F>(&self, f: F) -> Effect<R, E, A>
    where
        R: 'static,
        E: 'static,
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        let cell = self.cell.clone();
        Effect::encase(move |_r: &R| {
            let mut guard = cell.lock().unwrap();
            let next = f(guard.clone());
            *guard = next.clone();
            Ok(next)
        })
    }
}

type Waiter<A, E> = Box<dyn FnOnce(Result<A, Failure<E>>) + Send>;

enum AwaitState<A, E> {
    Pending(Vec<Waiter<A, E>>),
    Settled(Result<A, Failure<E>>),
}

/// A single-assignment cell settled at most once and observed any number of
/// times — the Rust analogue of a resolved `Promise`
/// shared by several readers, but built on callbacks rather than
/// `std::future::Future` so it composes with the rest of this crate's
/// register/resolve style.
pub struct Await<E, A> {
    state: Arc<Mutex<AwaitState<A, E>>>,
}

impl<E, A> Clone for Await<E, A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<E, A> Await<E, A>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AwaitState::Pending(Vec::new()))),
        }
    }

    /// Settles the cell with a success, yielding whether this call was the
    /// one that performed the settle (a no-op, matching `Await`'s
    /// idempotence, if already settled). Every waiter registered via
    /// [`Self::get`] is resumed on the scheduler via `asap`, never called
    /// inline, so the setter's own continuation never runs nested inside
    /// a waiter's.
    pub fn resolve<R>(&self, value: A) -> Effect<R, E, bool>
    where
        R: 'static,
    {
        self.settle(Ok(value))
    }

    /// Settles the cell with a failure. See [`Self::resolve`].
    pub fn reject<R>(&self, error: E) -> Effect<R, E, bool>
    where
        R: 'static,
    {
        self.settle(Err(Failure::Typed(error)))
    }

    fn settle<R>(&self, result: Result<A, Failure<E>>) -> Effect<R, E, bool>
    where
        R: 'static,
    {
        let state = self.state.clone();
        let result = Arc::new(Mutex::new(Some(result)));
        Effect::from_register(move |_r: &R, sched, resolve| {
            let result = result.lock().unwrap().take().expect("settle runs at most once");
            let waiters = {
                let mut guard = state.lock().unwrap();
                match &*guard {
                    AwaitState::Settled(_) => None,
                    AwaitState::Pending(_) => {
                        match std::mem::replace(&mut *guard, AwaitState::Settled(result.clone())) {
                            AwaitState::Pending(waiters) => Some(waiters),
                            AwaitState::Settled(_) => unreachable!(),
                        }
                    }
                }
            };
            match waiters {
                None => resolve(Ok(upcast(false))),
                Some(waiters) => {
                    for waiter in waiters {
                        let result = result.clone();
                        sched.asap(Box::new(move || waiter(result)));
                    }
                    resolve(Ok(upcast(true)));
                }
            }
            CancelToken::new()
        })
    }

    /// Non-blocking check of whether the cell has settled yet, the signal
    /// [`crate::stream::Stream::halt_when`] consults before pulling each
    /// element rather than suspending the way `get` does.
    pub fn is_set<R>(&self) -> Effect<R, E, bool>
    where
        R: 'static,
    {
        let state = self.state.clone();
        Effect::encase(move |_r: &R| Ok(matches!(&*state.lock().unwrap(), AwaitState::Settled(_))))
    }

    /// Observes the settled value as an effect; suspends until settled if
    /// not yet resolved. A waiter registered while pending is resumed via
    /// `asap` from inside the call to [`Self::resolve`]/[`Self::reject`]
    /// that settles the cell, never inline.
    pub fn get<R>(&self) -> Effect<R, E, A>
    where
        R: 'static,
    {
        let state = self.state.clone();
        Effect::from_register(move |_r: &R, sched, resolve| {
            let mut guard = state.lock().unwrap();
            match &*guard {
                AwaitState::Settled(result) => {
                    let result = result.clone();
                    drop(guard);
                    sched.asap(Box::new(move || resolve(result.map(upcast))));
                }
                AwaitState::Pending(_) => {
                    if let AwaitState::Pending(waiters) = &mut *guard {
                        waiters.push(Box::new(move |result| resolve(result.map(upcast))));
                    }
                }
            }
            CancelToken::new()
        })
    }
}

impl<E, A> Default for Await<E, A>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

struct PendingOffer<A> {
    value: Arc<Mutex<Option<A>>>,
    wake: Box<dyn FnOnce() + Send>,
}

struct QueueState<A> {
    items: VecDeque<A>,
    capacity: usize,
    takers: VecDeque<Box<dyn FnOnce(A) + Send>>,
    offerers: VecDeque<PendingOffer<A>>,
}

impl<A> QueueState<A> {
    /// If there is now room and an offerer is waiting, moves its value into
    /// the buffer and wakes it. Called after any pop frees a slot (spec
    /// §4.4: "at most one of the two waiter lists is non-empty at any
    /// time" — a pop either hands directly to a taker or promotes the
    /// oldest offerer, never both).
    fn promote_one_offerer(&mut self) {
        if self.items.len() < self.capacity {
            if let Some(offer) = self.offerers.pop_front() {
                if let Some(value) = offer.value.lock().unwrap().take() {
                    self.items.push_back(value);
                }
                (offer.wake)();
            }
        }
    }
}

/// A capacity-bounded FIFO queue of values, produced and consumed only
/// through effects. A `push` that arrives while a `pop`
/// is already waiting hands the value straight to the waiting consumer
/// rather than round-tripping through the backing deque; a `push` that
/// arrives when the buffer is already full suspends as an offer-waiter
/// until a later `pop` frees a slot.
pub struct Queue<A> {
    state: Arc<Mutex<QueueState<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A> Queue<A>
where
    A: Send + Sync + 'static,
{
    /// Creates an unbounded queue (`push` never blocks).
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Creates a queue that holds at most `capacity` buffered items before
    /// `push` starts suspending.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity,
                takers: VecDeque::new(),
                offerers: VecDeque::new(),
            })),
        }
    }

    /// Pushes a value: hands it directly to a waiting `pop` if one exists,
    /// buffers it if capacity remains, or suspends as an offer-waiter until
    /// a slot frees. `value` lives behind a take-once
    /// `Mutex<Option<A>>` since `from_register`'s closure must be `Fn` even
    /// though a push is only ever meaningfully executed once.
    pub fn push<R, E>(&self, value: A) -> Effect<R, E, ()>
    where
        R: 'static,
        E: 'static,
    {
        let state = self.state.clone();
        let value = Arc::new(Mutex::new(Some(value)));
        Effect::from_register(move |_r: &R, sched, resolve| {
            let mut guard = state.lock().unwrap();
            if let Some(taker) = guard.takers.pop_front() {
                drop(guard);
                let v = value.lock().unwrap().take().expect("keel-types: queue push effect executed more than once");
                taker(v);
                resolve(Ok(upcast(())));
            } else if guard.items.len() < guard.capacity {
                let v = value.lock().unwrap().take().expect("keel-types: queue push effect executed more than once");
                guard.items.push_back(v);
                drop(guard);
                resolve(Ok(upcast(())));
            } else {
                let resolve = Arc::new(Mutex::new(Some(resolve)));
                guard.offerers.push_back(PendingOffer {
                    value: value.clone(),
                    wake: Box::new(move || {
                        if let Some(resolve) = resolve.lock().unwrap().take() {
                            resolve(Ok(upcast(())));
                        }
                    }),
                });
            }
            let _ = sched;
            CancelToken::new()
        })
    }

    /// Pops the next value, suspending until one is available if the queue
    /// is currently empty; frees a slot for the oldest offer-waiter, if any.
    pub fn pop<R, E>(&self) -> Effect<R, E, A>
    where
        R: 'static,
        E: 'static,
    {
        let state = self.state.clone();
        Effect::from_register(move |_r: &R, sched, resolve| {
            let mut guard = state.lock().unwrap();
            match guard.items.pop_front() {
                Some(item) => {
                    guard.promote_one_offerer();
                    drop(guard);
                    resolve(Ok(upcast(item)));
                }
                None => {
                    guard.takers.push_back(Box::new(move |item| {
                        resolve(Ok(upcast(item)));
                    }));
                }
            }
            let _ = sched;
            CancelToken::new()
        })
    }

    /// Pushes a value immediately from outside the effect system, bypassing
    /// capacity — the bridging point [`crate::stream::Stream::from_event_emitter`]
    /// uses to turn an external callback-driven source into queue items,
    /// the same way an `Async` instruction's `resolve` callback is itself
    /// plain non-effect code invoked from wherever the external work
    /// actually completes.
    pub(crate) fn push_now(&self, value: A) {
        let mut guard = self.state.lock().unwrap();
        if let Some(taker) = guard.takers.pop_front() {
            drop(guard);
            taker(value);
        } else {
            guard.items.push_back(value);
        }
    }

    /// Number of items currently buffered (no pending `pop` has claimed
    /// them yet; offer-waiters blocked on a full queue are not counted).
    pub fn size<R, E>(&self) -> Effect<R, E, usize>
    where
        R: 'static,
        E: 'static,
    {
        let state = self.state.clone();
        Effect::encase(move |_r: &R| Ok(state.lock().unwrap().items.len()))
    }
}

impl<A> Default for Queue<A>
where
    A: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
