use std::sync::Arc;

use keel_types::instruction::{AnyValue, CatchFn, ChainFn, MapFn};
use keel_types::{CancelToken, Failure, Instruction};

/// A single continuation frame pushed when a `Map`/`Chain`/`Catch` node's
/// source instruction is being evaluated; popped once that source settles.
/// An explicit stack instead of native recursion, so deeply chained
/// effects never overflow the Rust call stack.
pub(crate) enum Frame<R, E> {
    Map(MapFn),
    Chain(ChainFn<R, E>),
    Catch(CatchFn<R, E>),
}

/// What the fiber is doing right now.
pub(crate) enum Current<R, E> {
    /// About to evaluate this instruction.
    Instr(Arc<Instruction<R, E>>),
    /// A value just produced by the instruction at the top of the frame
    /// stack, waiting to be delivered to the next frame.
    Value(AnyValue),
    /// A failure just produced, waiting to be delivered to the nearest
    /// `Catch` frame, skipping any `Map`/`Chain` frames in between.
    Failure(Failure<E>),
    /// The fiber has produced its final result.
    Done(Result<AnyValue, Failure<E>>),
    /// Execution is suspended on an outstanding `Async` registration;
    /// nothing left to drive until its callback fires.
    Suspended(CancelToken),
}

/// The trampoline's entire state for one running effect. `frames` is the
/// continuation stack; `current` is what happens
/// next. Stepping the fiber forward is purely a function of these two
/// fields plus the environment, which is why it can be driven one turn at
/// a time by the scheduler rather than needing a native stack frame per
/// pending continuation.
pub(crate) struct Fiber<R, E> {
    pub(crate) frames: Vec<Frame<R, E>>,
    pub(crate) current: Current<R, E>,
}

impl<R, E> Fiber<R, E> {
    pub(crate) fn start(instr: Arc<Instruction<R, E>>) -> Self {
        Self {
            frames: Vec::new(),
            current: Current::Instr(instr),
        }
    }
}
