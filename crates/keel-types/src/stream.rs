use std::sync::{Arc, Mutex};

use crate::concurrency::{Await, Queue};
use crate::effect::Effect;
use crate::scheduler::CancelToken;

/// Boxed step function shared (via `Arc<Mutex<_>>`) across the recursive
/// chain of effects a fold builds; `FnMut` doesn't implement `Clone`, but
/// every continuation closure in this module only needs `&mut` access
/// through the lock, never ownership, so a shared lock is enough to drive
/// it across any number of elements without cloning the closure itself.
type Step<R, E, A> = Arc<Mutex<Box<dyn FnMut(A) -> Effect<R, E, bool> + Send>>>;

/// Boxed element-producer shared across [`Stream::produce`]'s recursive
/// pull loop.
type ProduceFn<R, E, A> = Arc<dyn Fn(&R) -> Effect<R, E, Option<A>> + Send + Sync>;

/// A handle to an external push-based event source, the bridging point
/// [`Stream::from_event_emitter`] subscribes to — Rust has no ambient
/// EventEmitter type the way the system this crate is modeled on assumed.
pub trait Emitter<A>: Send + Sync {
    /// Subscribes `on_event` to every future event, returning a token that
    /// the stream cancels once it stops pulling. An implementation that
    /// wants to stop emitting once unsubscribed should check the token.
    fn subscribe(&self, on_event: Box<dyn Fn(A) + Send + Sync>) -> CancelToken;
}

/// A lazy, pull-based sequence of values layered on [`Effect`].
///
/// A `Stream` is not itself an instruction; it is a fold waiting to be
/// given a step function, the same way `Iterator::fold` is the one
/// operation every other combinator on an iterator reduces to. Building a
/// `Stream` never produces values — only running the effect `fold_with`
/// returns drives it.
pub struct Stream<R, E, A> {
    pub(crate) fold: Arc<dyn Fn(Step<R, E, A>) -> Effect<R, E, ()> + Send + Sync>,
}

impl<R, E, A> Clone for Stream<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            fold: self.fold.clone(),
        }
    }
}

impl<R, E, A> Stream<R, E, A>
where
    R: 'static,
    E: 'static,
    A: 'static,
{
    /// Builds a stream directly from a fold implementation.
    pub fn from_fold<F>(fold: F) -> Self
    where
        F: Fn(Step<R, E, A>) -> Effect<R, E, ()> + Send + Sync + 'static,
    {
        Self {
            fold: Arc::new(fold),
        }
    }

    /// Runs `step` over every element in turn, stopping early if `step`
    /// ever yields `false`.
    pub fn fold_with<F>(&self, step: F) -> Effect<R, E, ()>
    where
        F: FnMut(A) -> Effect<R, E, bool> + Send + 'static,
    {
        (self.fold)(Arc::new(Mutex::new(Box::new(step))))
    }

    /// Wraps `step` so each element is transformed by `f` before the
    /// original step ever sees it.
    pub fn map<B, F>(&self, f: F) -> Stream<R, E, B>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
        B: 'static,
    {
        let inner = self.clone();
        let f = Arc::new(f);
        Stream::from_fold(move |step: Step<R, E, B>| {
            let f = f.clone();
            inner.fold_with(move |a| {
                let mut guard = step.lock().unwrap();
                (guard)(f(a))
            })
        })
    }

    /// Flattens: each element becomes a sub-stream, folded into the same
    /// accumulator and the same halt decision — a `keep_going` answer of
    /// `false` from the inner step stops both the sub-stream and `self`.
    pub fn chain<B, F>(&self, f: F) -> Stream<R, E, B>
    where
        F: Fn(A) -> Stream<R, E, B> + Send + Sync + 'static,
        B: Send + 'static,
    {
        let inner = self.clone();
        let f = Arc::new(f);
        Stream::from_fold(move |step: Step<R, E, B>| {
            let f = f.clone();
            inner.fold_with(move |a| {
                let sub = f(a);
                let step = step.clone();
                let keep_going = Arc::new(Mutex::new(true));
                let keep_going_writer = keep_going.clone();
                sub.fold_with(move |b| {
                    let keep_going_writer = keep_going_writer.clone();
                    let mut guard = step.lock().unwrap();
                    (guard)(b).map(move |keep| {
                        *keep_going_writer.lock().unwrap() = keep;
                        keep
                    })
                })
                .map(move |_unit| *keep_going.lock().unwrap())
            })
        })
    }

    /// Skips elements `predicate` rejects, without invoking the original
    /// step for them.
    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
        A: Send,
    {
        let inner = self.clone();
        let predicate = Arc::new(predicate);
        Self::from_fold(move |step: Step<R, E, A>| {
            let predicate = predicate.clone();
            inner.fold_with(move |a| {
                if predicate(&a) {
                    let mut guard = step.lock().unwrap();
                    (guard)(a)
                } else {
                    Effect::of(true)
                }
            })
        })
    }

    /// Runs `effect` once per element, in order: a fold with unit state and
    /// `cont` always `true`.
    pub fn for_each<F>(&self, effect: F) -> Effect<R, E, ()>
    where
        F: Fn(A) -> Effect<R, E, ()> + Send + Sync + 'static,
    {
        self.fold_with(move |a| effect(a).map(|_unit| true))
    }

    /// Stops pulling once `awaitable` has settled. Consulted before every
    /// element rather than after, so an already-settled awaitable yields no
    /// elements at all.
    pub fn halt_when<H>(&self, awaitable: Await<E, H>) -> Self
    where
        H: Clone + Send + Sync + 'static,
        A: Send,
    {
        let inner = self.clone();
        Self::from_fold(move |step: Step<R, E, A>| {
            let awaitable = awaitable.clone();
            inner.fold_with(move |a| {
                let step = step.clone();
                let a = Arc::new(Mutex::new(Some(a)));
                awaitable.is_set().chain(move |halted| {
                    if halted {
                        Effect::of(false)
                    } else {
                        let mut guard = step.lock().unwrap();
                        let a = a.lock().unwrap().take().expect(
                            "keel-types: halt_when step forced more than once",
                        );
                        (guard)(a)
                    }
                })
            })
        })
    }

    /// Folds to completion (`cont` always `true`), threading `seed` through
    /// `f` once per element.
    pub fn fold_left<S, F>(&self, seed: S, f: F) -> Effect<R, E, S>
    where
        F: Fn(S, A) -> S + Send + Sync + 'static,
        S: Clone + Send + 'static,
    {
        let acc = Arc::new(Mutex::new(seed));
        let acc_for_fold = acc.clone();
        self.fold_with(move |a| {
            let mut guard = acc_for_fold.lock().unwrap();
            let next = f(guard.clone(), a);
            *guard = next;
            Effect::of(true)
        })
        .map(move |_unit| acc.lock().unwrap().clone())
    }

    /// Collects every element into a `Vec`, in order.
    pub fn as_array(&self) -> Effect<R, E, Vec<A>>
    where
        A: Clone + Send,
    {
        self.fold_left(Vec::new(), |mut acc, a| {
            acc.push(a);
            acc
        })
    }

    /// A finite stream over the elements of `items`, in order.
    pub fn from_array(items: Vec<A>) -> Self
    where
        A: Send,
    {
        let items = Arc::new(items);
        Self::from_fold(move |step| drain_array(items.clone(), 0, step))
    }

    /// A stream of exactly one element.
    pub fn of(value: A) -> Self
    where
        A: Clone + Send + Sync,
    {
        Self::from_fold(move |step| {
            let value = value.clone();
            Effect::suspend(move |_r| {
                let mut guard = step.lock().unwrap();
                (guard)(value.clone())
            })
            .map(|_keep_going| ())
        })
    }

    /// An infinite stream that repeats `value` until the consumer's step
    /// returns `false`.
    pub fn const_(value: A) -> Self
    where
        A: Clone + Send + Sync,
    {
        Self::from_fold(move |step| step_const(value.clone(), step))
    }

    /// A stream of exactly one element, computed by running `effect`.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self
    where
        A: Send,
    {
        Self::from_fold(move |step| {
            effect
                .clone()
                .chain(move |value| {
                    let mut guard = step.lock().unwrap();
                    (guard)(value)
                })
                .map(|_keep_going| ())
        })
    }

    /// Repeatedly asks `f` for the next element; `None` ends the stream.
    /// Backpressure holds here too: `f` is not asked again until the
    /// previous element's step effect has completed.
    pub fn produce<F>(f: F) -> Self
    where
        F: Fn(&R) -> Effect<R, E, Option<A>> + Send + Sync + 'static,
        A: Send,
    {
        let f: ProduceFn<R, E, A> = Arc::new(f);
        Self::from_fold(move |step| step_produce(f.clone(), step))
    }

    /// A stream that never produces any elements and never completes.
    pub fn never() -> Self {
        Self::from_fold(|_step| Effect::never())
    }

    /// A stream that immediately fails with `error`, without producing any
    /// elements.
    pub fn reject(error: E) -> Self
    where
        E: Clone + Send + Sync,
    {
        Self::from_fold(move |_step| Effect::reject(error.clone()))
    }

    /// A stream driven by an external [`Queue`]: pulls elements off the
    /// queue one at a time until the consumer's step returns `false`.
    pub fn from_queue(queue: Queue<A>) -> Self
    where
        A: Send + Sync,
    {
        Self::from_fold(move |step| pull_loop(queue.clone(), step))
    }

    /// Bridges an external push-based source into a stream: `emitter` is
    /// subscribed once per execution, and every event it delivers is
    /// buffered onto an internal queue that the fold pulls from, in arrival
    /// order, via the same protocol [`Self::from_queue`] uses. The
    /// subscription is cancelled once the fold stops pulling, whether the
    /// consumer halted early or the underlying queue was abandoned.
    pub fn from_event_emitter(emitter: Arc<dyn Emitter<A>>) -> Self
    where
        A: Send + Sync,
    {
        Self::from_fold(move |step| {
            let queue: Queue<A> = Queue::new();
            let queue_for_emitter = queue.clone();
            let subscription = emitter.subscribe(Box::new(move |value| queue_for_emitter.push_now(value)));
            pull_loop(queue, step).map(move |unit| {
                subscription.cancel();
                unit
            })
        })
    }
}

impl<R, E> Stream<R, E, i64>
where
    R: 'static,
    E: 'static,
{
    /// A finite stream over `start..end`, in order.
    pub fn range(start: i64, end: i64) -> Self {
        Self::from_fold(move |step| step_range(start, end, step))
    }

    /// A stream that emits an incrementing tick every `period_ms` logical
    /// milliseconds, forever.
    pub fn interval(period_ms: u64) -> Self {
        Self::from_fold(move |step| step_interval(0, period_ms, step))
    }
}

fn drain_array<R, E, A>(items: Arc<Vec<A>>, index: usize, step: Step<R, E, A>) -> Effect<R, E, ()>
where
    R: 'static,
    E: 'static,
    A: Clone + 'static,
{
    if index >= items.len() {
        return Effect::of(());
    }
    let item = items[index].clone();
    Effect::suspend(move |_r| {
        let mut guard = step.lock().unwrap();
        (guard)(item.clone())
    })
    .chain({
        let items = items.clone();
        let step = step.clone();
        move |keep_going| {
            if keep_going {
                drain_array(items.clone(), index + 1, step.clone())
            } else {
                Effect::of(())
            }
        }
    })
}

fn step_range<R, E>(current: i64, end: i64, step: Step<R, E, i64>) -> Effect<R, E, ()>
where
    R: 'static,
    E: 'static,
{
    if current >= end {
        return Effect::of(());
    }
    let step_for_call = step.clone();
    Effect::suspend(move |_r| {
        let mut guard = step_for_call.lock().unwrap();
        (guard)(current)
    })
    .chain(move |keep_going| {
        if keep_going {
            step_range(current + 1, end, step.clone())
        } else {
            Effect::of(())
        }
    })
}

fn step_const<R, E, A>(value: A, step: Step<R, E, A>) -> Effect<R, E, ()>
where
    R: 'static,
    E: 'static,
    A: Clone + Send + 'static,
{
    let value_for_call = value.clone();
    let step_for_call = step.clone();
    Effect::suspend(move |_r| {
        let mut guard = step_for_call.lock().unwrap();
        (guard)(value_for_call.clone())
    })
    .chain(move |keep_going| {
        if keep_going {
            step_const(value.clone(), step.clone())
        } else {
            Effect::of(())
        }
    })
}

fn step_interval<R, E>(tick: i64, period_ms: u64, step: Step<R, E, i64>) -> Effect<R, E, ()>
where
    R: 'static,
    E: 'static,
{
    let step_for_call = step.clone();
    Effect::of(())
        .delay(period_ms)
        .chain(move |_unit| {
            let mut guard = step_for_call.lock().unwrap();
            (guard)(tick)
        })
        .chain(move |keep_going| {
            if keep_going {
                step_interval(tick + 1, period_ms, step.clone())
            } else {
                Effect::of(())
            }
        })
}

fn step_produce<R, E, A>(f: ProduceFn<R, E, A>, step: Step<R, E, A>) -> Effect<R, E, ()>
where
    R: 'static,
    E: 'static,
    A: Send + 'static,
{
    let step_for_call = step.clone();
    let f_for_call = f.clone();
    Effect::suspend(move |r| f_for_call(r))
        .chain(move |maybe_value| match maybe_value {
            Some(value) => {
                let mut guard = step_for_call.lock().unwrap();
                (guard)(value)
            }
            None => Effect::of(false),
        })
        .chain(move |keep_going| {
            if keep_going {
                step_produce(f.clone(), step.clone())
            } else {
                Effect::of(())
            }
        })
}

fn pull_loop<R, E, A>(queue: Queue<A>, step: Step<R, E, A>) -> Effect<R, E, ()>
where
    R: 'static,
    E: 'static,
    A: Send + Sync + 'static,
{
    queue.pop().chain(move |item| {
        let queue = queue.clone();
        let step_for_call = step.clone();
        let item = Arc::new(Mutex::new(Some(item)));
        Effect::suspend(move |_r| {
            let mut guard = step_for_call.lock().unwrap();
            let item = item
                .lock()
                .unwrap()
                .take()
                .expect("keel-types: stream pull step forced more than once");
            (guard)(item)
        })
        .chain({
            let queue = queue.clone();
            let step = step.clone();
            move |keep_going| {
                if keep_going {
                    pull_loop(queue.clone(), step.clone())
                } else {
                    Effect::of(())
                }
            }
        })
    })
}
