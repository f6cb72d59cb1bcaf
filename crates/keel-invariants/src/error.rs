/// Describes a specific algebraic law violation (invariants 1-10).
///
/// Each variant maps 1:1 to one of the ten testable properties every
/// `Effect` is required to satisfy regardless of how it was built. Grouped:
/// Identity laws (L-1..L-5), Catch laws (L-6..L-7), Runtime guarantees
/// (L-8..L-10).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LawViolation {
    /// L-1: executing the same effect twice must not let one run observe
    /// the other's state.
    NotReferentiallyTransparent { first: String, second: String },
    /// L-2: `of(a).chain(f)` must equal `f(a)`.
    LeftIdentityBroken { via_chain: String, direct: String },
    /// L-3: `e.chain(of)` must equal `e`.
    RightIdentityBroken { chained: String, original: String },
    /// L-4: `e.chain(f).chain(g)` must equal `e.chain(x => f(x).chain(g))`.
    ChainNotAssociative { left: String, right: String },
    /// L-5: `e.map(f).map(g)` must equal `e.map(x => g(f(x)))`.
    MapNotFused { composed: String, fused: String },
    /// L-6: `of(a).catch(h)` must equal `of(a)`; `catch` must not run on success.
    CatchRanOnSuccess { value: String },
    /// L-7: `reject(e).catch(h)` must equal `h(e)`.
    CatchDidNotRecover { expected: String, actual: String },
    /// L-8: a chain of the given depth must complete without overflowing
    /// the native call stack.
    StackUnsafe { depth: u64 },
    /// L-9: cancelling a fiber twice must be equivalent to cancelling it once.
    CancelNotIdempotent { cancel_count: u32 },
    /// L-10: exactly one of success/failure may be delivered per execution.
    MultipleTerminalCallbacks { success_count: u32, failure_count: u32 },
}

impl std::fmt::Display for LawViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReferentiallyTransparent { first, second } => write!(
                f,
                "L-1: two executions of the same effect diverged: {first} vs {second}"
            ),
            Self::LeftIdentityBroken { via_chain, direct } => write!(
                f,
                "L-2: of(a).chain(f) != f(a): {via_chain} vs {direct}"
            ),
            Self::RightIdentityBroken { chained, original } => write!(
                f,
                "L-3: e.chain(of) != e: {chained} vs {original}"
            ),
            Self::ChainNotAssociative { left, right } => write!(
                f,
                "L-4: chain is not associative: {left} vs {right}"
            ),
            Self::MapNotFused { composed, fused } => write!(
                f,
                "L-5: map(f).map(g) != map(g . f): {composed} vs {fused}"
            ),
            Self::CatchRanOnSuccess { value } => write!(
                f,
                "L-6: catch ran on a successful effect, got {value}"
            ),
            Self::CatchDidNotRecover { expected, actual } => write!(
                f,
                "L-7: catch did not recover as h(e): expected {expected}, got {actual}"
            ),
            Self::StackUnsafe { depth } => write!(
                f,
                "L-8: a chain of depth {depth} failed to complete without overflowing the native stack"
            ),
            Self::CancelNotIdempotent { cancel_count } => write!(
                f,
                "L-9: cancel was not idempotent after {cancel_count} calls"
            ),
            Self::MultipleTerminalCallbacks { success_count, failure_count } => write!(
                f,
                "L-10: expected exactly one terminal callback, got {success_count} success and {failure_count} failure"
            ),
        }
    }
}

impl std::error::Error for LawViolation {}

/// Describes a specific end-to-end scenario violation (scenarios a-f).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScenarioViolation {
    /// a: `of(10).map(i => i + 1)` must resolve to 11 synchronously.
    MapScenarioMismatch { expected: i64, actual: String },
    /// b: a panic thrown inside `map` must surface as a typed failure at
    /// logical time 1, not as a process-level panic.
    PanicNotCaughtAsFailure { actual: String },
    /// c: `race` of two timeouts must resolve with the shorter one's value
    /// at its own logical time, and the longer one must never fire.
    RaceDidNotPreferShorter { expected: String, actual: String, longer_fired: bool },
    /// d: `zip` of a fast failure and a slower success must reject at the
    /// failure's logical time, with the sibling never resolving.
    ZipDidNotShortCircuit { actual: String, slower_fired: bool },
    /// e: a capacity-bounded queue must preserve FIFO order across
    /// interleaved offers and takes, blocking offers past capacity.
    QueueOrderingViolated { expected: Vec<i64>, actual: Vec<i64> },
    /// f: `Await` must deliver the same settled result to every waiter, in
    /// FIFO subscription order, strictly after the setting turn.
    AwaitFifoViolated { expected: Vec<i64>, actual: Vec<i64> },
    /// g: `once()` on a composite effect must run the wrapped chain exactly
    /// once even when multiple executions join while the first is still in
    /// flight, fanning the single cached result out to every joiner.
    OnceRanMoreThanOnce { run_count: u32, results: Vec<i64> },
}

impl std::fmt::Display for ScenarioViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MapScenarioMismatch { expected, actual } => write!(
                f,
                "scenario a: expected {expected}, got {actual}"
            ),
            Self::PanicNotCaughtAsFailure { actual } => write!(
                f,
                "scenario b: panic inside map was not delivered as a typed failure, got {actual}"
            ),
            Self::RaceDidNotPreferShorter { expected, actual, longer_fired } => write!(
                f,
                "scenario c: expected {expected}, got {actual} (longer branch fired: {longer_fired})"
            ),
            Self::ZipDidNotShortCircuit { actual, slower_fired } => write!(
                f,
                "scenario d: expected the fast failure, got {actual} (slower branch fired: {slower_fired})"
            ),
            Self::QueueOrderingViolated { expected, actual } => write!(
                f,
                "scenario e: expected delivery order {expected:?}, got {actual:?}"
            ),
            Self::AwaitFifoViolated { expected, actual } => write!(
                f,
                "scenario f: expected FIFO delivery {expected:?}, got {actual:?}"
            ),
            Self::OnceRanMoreThanOnce { run_count, results } => write!(
                f,
                "scenario g: expected the wrapped chain to run exactly once and deliver the same result to every joiner, ran {run_count} times, delivered {results:?}"
            ),
        }
    }
}

impl std::error::Error for ScenarioViolation {}

/// Describes a specific `Stream` combinator or source violation (S-1..S-6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamViolation {
    /// S-1: `map` must transform every element before the consumer sees it.
    MapMismatch { expected: Vec<i64>, actual: Vec<i64> },
    /// S-2: `chain` must flatten each element's sub-stream into the same
    /// accumulator, in order.
    ChainMismatch { expected: Vec<i64>, actual: Vec<i64> },
    /// S-3: `filter` must only forward elements the predicate accepts.
    FilterMismatch { expected: Vec<i64>, actual: Vec<i64> },
    /// S-4: backpressure is structural — the source must not produce its
    /// next element until the previous step's own effect has completed.
    BackpressureViolated { expected: Vec<i64>, actual: Vec<i64> },
    /// S-5: `halt_when` must stop pulling as soon as the awaitable settles,
    /// without requiring the source itself to be exhausted.
    HaltWhenDidNotStop { collected: Vec<i64> },
    /// S-6: a stream bridged from an external push source must deliver
    /// events to the consumer in arrival order.
    EventEmitterOrderViolated { expected: Vec<i64>, actual: Vec<i64> },
}

impl std::fmt::Display for StreamViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MapMismatch { expected, actual } => write!(
                f,
                "S-1: stream map mismatch: expected {expected:?}, got {actual:?}"
            ),
            Self::ChainMismatch { expected, actual } => write!(
                f,
                "S-2: stream chain did not flatten in order: expected {expected:?}, got {actual:?}"
            ),
            Self::FilterMismatch { expected, actual } => write!(
                f,
                "S-3: stream filter mismatch: expected {expected:?}, got {actual:?}"
            ),
            Self::BackpressureViolated { expected, actual } => write!(
                f,
                "S-4: stream backpressure violated: expected order {expected:?}, got {actual:?}"
            ),
            Self::HaltWhenDidNotStop { collected } => write!(
                f,
                "S-5: halt_when did not stop pulling, collected {collected:?}"
            ),
            Self::EventEmitterOrderViolated { expected, actual } => write!(
                f,
                "S-6: event emitter stream delivered out of order: expected {expected:?}, got {actual:?}"
            ),
        }
    }
}

impl std::error::Error for StreamViolation {}
