//! `Stream` combinator and source checks (S-1..S-6).
//!
//! Each `check_*` function runs a small stream program to completion
//! against a fresh [`TestScheduler`] and compares the observed elements,
//! returning the matching [`StreamViolation`] if they disagree. Same split
//! as `laws`/`scenarios`: the checker is reusable outside its own `#[test]`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use keel_runtime::{unsafe_execute_sync, TestScheduler};
use keel_types::{Await, CancelToken, Effect, Emitter, Stream};

use crate::error::StreamViolation;

type Env = ();
type Err = String;

const DEFAULT_ADVANCE_MS: u64 = 10_000;

fn run<A>(effect: Effect<Env, Err, A>) -> Result<A, String>
where
    A: std::fmt::Debug + Send + 'static,
{
    let scheduler = TestScheduler::new();
    unsafe_execute_sync(effect, (), &scheduler, DEFAULT_ADVANCE_MS).map_err(|e| format!("{e}"))
}

/// S-1: `map` transforms every element before the consumer sees it.
pub fn check_map() -> Result<(), StreamViolation> {
    let source: Stream<Env, Err, i64> = Stream::from_array(vec![1, 2, 3]);
    let doubled = source.map(|n| n * 2);
    let actual = run(doubled.as_array()).unwrap_or_default();
    let expected = vec![2, 4, 6];
    if actual == expected {
        Ok(())
    } else {
        Err(StreamViolation::MapMismatch { expected, actual })
    }
}

/// S-2: `chain` flattens each element's sub-stream into the same
/// accumulator, in order.
pub fn check_chain() -> Result<(), StreamViolation> {
    let source: Stream<Env, Err, i64> = Stream::from_array(vec![1, 2]);
    let flattened = source.chain(|n| Stream::from_array(vec![n, n * 10]));
    let actual = run(flattened.as_array()).unwrap_or_default();
    let expected = vec![1, 10, 2, 20];
    if actual == expected {
        Ok(())
    } else {
        Err(StreamViolation::ChainMismatch { expected, actual })
    }
}

/// S-3: `filter` only forwards elements the predicate accepts.
pub fn check_filter() -> Result<(), StreamViolation> {
    let source: Stream<Env, Err, i64> = Stream::from_array(vec![1, 2, 3, 4, 5, 6]);
    let evens = source.filter(|n| n % 2 == 0);
    let actual = run(evens.as_array()).unwrap_or_default();
    let expected = vec![2, 4, 6];
    if actual == expected {
        Ok(())
    } else {
        Err(StreamViolation::FilterMismatch { expected, actual })
    }
}

/// S-4: the source must not produce its next element until the previous
/// step's own effect has completed. Checked by recording, for each
/// element, whether another element's step was already in flight when it
/// started — structural backpressure means that count stays zero even
/// though every step is delayed.
pub fn check_backpressure() -> Result<(), StreamViolation> {
    let source: Stream<Env, Err, i64> = Stream::from_array(vec![1, 2, 3]);
    let order: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));
    let order_writer = order.clone();

    let overlapped_for_program = overlapped.clone();
    let program = source.for_each(move |n| {
        if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            overlapped_for_program.fetch_add(1, Ordering::SeqCst);
        }
        let order_writer = order_writer.clone();
        let in_flight = in_flight.clone();
        Effect::of(()).delay(5).map(move |_unit| {
            order_writer.lock().unwrap().push(n);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        })
    });

    let _ = run(program);
    let actual = order.lock().unwrap().clone();
    let expected = vec![1, 2, 3];
    if actual == expected && overlapped.load(Ordering::SeqCst) == 0 {
        Ok(())
    } else {
        Err(StreamViolation::BackpressureViolated { expected, actual })
    }
}

/// S-5: `halt_when` stops pulling as soon as the awaitable settles, even
/// though the source itself (`range(0, 1_000_000)`) is far from exhausted.
pub fn check_halt_when() -> Result<(), StreamViolation> {
    let source: Stream<Env, Err, i64> = Stream::range(0, 1_000_000);
    let halt: Await<Err, ()> = Await::new();
    let collected: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let collected_writer = collected.clone();
    let halt_gate = halt.clone();

    let gated = source.halt_when(halt_gate);
    let program = gated.for_each(move |n| {
        let collected_writer = collected_writer.clone();
        let halt = halt.clone();
        Effect::suspend(move |_r: &Env| {
            collected_writer.lock().unwrap().push(n);
            if n == 2 {
                halt.resolve(()).map(|_settled| ())
            } else {
                Effect::of(())
            }
        })
    });

    let _ = run(program);
    let collected = collected.lock().unwrap().clone();
    if collected == vec![0, 1, 2] {
        Ok(())
    } else {
        Err(StreamViolation::HaltWhenDidNotStop { collected })
    }
}

struct VecEmitter {
    items: Vec<i64>,
}

impl Emitter<i64> for VecEmitter {
    fn subscribe(&self, on_event: Box<dyn Fn(i64) + Send + Sync>) -> CancelToken {
        for item in &self.items {
            on_event(*item);
        }
        CancelToken::new()
    }
}

/// S-6: a stream bridged from an external push source delivers events to
/// the consumer in arrival order.
pub fn check_event_emitter_preserves_order() -> Result<(), StreamViolation> {
    let emitter: Arc<dyn Emitter<i64>> = Arc::new(VecEmitter { items: vec![7, 8, 9] });
    let source: Stream<Env, Err, i64> = Stream::from_event_emitter(emitter);
    let collected: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let collected_writer = collected.clone();

    let program = source.fold_with(move |n| {
        let mut guard = collected_writer.lock().unwrap();
        guard.push(n);
        Effect::of(guard.len() < 3)
    });

    let _ = run(program);
    let actual = collected.lock().unwrap().clone();
    let expected = vec![7, 8, 9];
    if actual == expected {
        Ok(())
    } else {
        Err(StreamViolation::EventEmitterOrderViolated { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_map_transforms_every_element() {
        assert_eq!(check_map(), Ok(()));
    }

    #[test]
    fn s2_chain_flattens_in_order() {
        assert_eq!(check_chain(), Ok(()));
    }

    #[test]
    fn s3_filter_skips_rejected_elements() {
        assert_eq!(check_filter(), Ok(()));
    }

    #[test]
    fn s4_backpressure_is_structural() {
        assert_eq!(check_backpressure(), Ok(()));
    }

    #[test]
    fn s5_halt_when_stops_pulling_once_settled() {
        assert_eq!(check_halt_when(), Ok(()));
    }

    #[test]
    fn s6_event_emitter_preserves_arrival_order() {
        assert_eq!(check_event_emitter_preserves_order(), Ok(()));
    }
}
