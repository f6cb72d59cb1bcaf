//! Algebraic law checkers (invariants 1-10).
//!
//! Each `check_*` function runs one or two small programs to completion
//! against a fresh [`TestScheduler`] and compares their observable result,
//! returning the matching [`LawViolation`] if they disagree. Kept separate
//! from the `#[test]` functions that call them so a law can be re-checked
//! against an arbitrary effect built elsewhere (e.g. from `scenarios`)
//! without duplicating the comparison logic.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use keel_runtime::{execute, unsafe_execute_sync, TestScheduler};
use keel_types::{Effect, Failure, Scheduler};

use crate::error::LawViolation;

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

/// L-1: executing the same effect description twice yields independent,
/// agreeing outcomes.
pub fn check_referential_transparency(build: impl Fn() -> Effect<Env, Err, i64>) -> Result<(), LawViolation> {
    let first = run(build());
    let second = run(build());
    if first == second {
        Ok(())
    } else {
        Err(LawViolation::NotReferentiallyTransparent {
            first: format!("{first:?}"),
            second: format!("{second:?}"),
        })
    }
}

/// L-2: `of(a).chain(f) ≡ f(a)`.
pub fn check_left_identity<F>(a: i64, f: F) -> Result<(), LawViolation>
where
    F: Fn(i64) -> Effect<Env, Err, i64> + Clone + Send + Sync + 'static,
{
    let via_chain_f = f.clone();
    let via_chain = run(Effect::of(a).chain(move |x| via_chain_f(x)));
    let direct = run(f(a));
    if via_chain == direct {
        Ok(())
    } else {
        Err(LawViolation::LeftIdentityBroken {
            via_chain: format!("{via_chain:?}"),
            direct: format!("{direct:?}"),
        })
    }
}

/// L-3: `e.chain(of) ≡ e`.
pub fn check_right_identity(build: impl Fn() -> Effect<Env, Err, i64>) -> Result<(), LawViolation> {
    let chained = run(build().chain(Effect::of));
    let original = run(build());
    if chained == original {
        Ok(())
    } else {
        Err(LawViolation::RightIdentityBroken {
            chained: format!("{chained:?}"),
            original: format!("{original:?}"),
        })
    }
}

/// L-4: `e.chain(f).chain(g) ≡ e.chain(x => f(x).chain(g))`.
pub fn check_chain_associativity<F, G>(
    build: impl Fn() -> Effect<Env, Err, i64>,
    f: F,
    g: G,
) -> Result<(), LawViolation>
where
    F: Fn(i64) -> Effect<Env, Err, i64> + Clone + Send + Sync + 'static,
    G: Fn(i64) -> Effect<Env, Err, i64> + Clone + Send + Sync + 'static,
{
    let f_left = f.clone();
    let g_left = g.clone();
    let left = run(build().chain(move |x| f_left(x)).chain(move |x| g_left(x)));

    let g_right = g.clone();
    let right = run(build().chain(move |x| f(x).chain(g_right.clone())));

    if left == right {
        Ok(())
    } else {
        Err(LawViolation::ChainNotAssociative {
            left: format!("{left:?}"),
            right: format!("{right:?}"),
        })
    }
}

/// L-5: `e.map(f).map(g) ≡ e.map(x => g(f(x)))`.
pub fn check_map_fusion<F, G>(build: impl Fn() -> Effect<Env, Err, i64>, f: F, g: G) -> Result<(), LawViolation>
where
    F: Fn(i64) -> i64 + Clone + Send + Sync + 'static,
    G: Fn(i64) -> i64 + Clone + Send + Sync + 'static,
{
    let f_composed = f.clone();
    let g_composed = g.clone();
    let composed = run(build().map(f_composed).map(g_composed));
    let fused = run(build().map(move |x| g(f(x))));
    if composed == fused {
        Ok(())
    } else {
        Err(LawViolation::MapNotFused {
            composed: format!("{composed:?}"),
            fused: format!("{fused:?}"),
        })
    }
}

/// L-6: `of(a).catch(h) ≡ of(a)`; `h` must not run on the success path.
pub fn check_catch_skipped_on_success(a: i64) -> Result<(), LawViolation> {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_marker = ran.clone();
    let effect: Effect<Env, Err, i64> = Effect::of(a).catch(move |_: Failure<Err>| {
        ran_marker.store(true, Ordering::SeqCst);
        Effect::of(-1)
    });
    let value = run(effect);
    if !ran.load(Ordering::SeqCst) && value == Ok(a) {
        Ok(())
    } else {
        Err(LawViolation::CatchRanOnSuccess { value: format!("{value:?}") })
    }
}

/// L-7: `reject(e).catch(h) ≡ h(e)`.
pub fn check_catch_recovers<F>(error: Err, h: F) -> Result<(), LawViolation>
where
    F: Fn(Failure<Err>) -> Effect<Env, Err, i64> + Clone + Send + Sync + 'static,
{
    let h_chained = h.clone();
    let actual = run(Effect::reject(error.clone()).catch(move |failure| h_chained(failure)));
    let expected = run(h(Failure::Typed(error)));
    if actual == expected {
        Ok(())
    } else {
        Err(LawViolation::CatchDidNotRecover {
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        })
    }
}

/// L-8: a chain of `depth` links built from `of(0).chain(n => of(n+1))`
/// completes without overflowing the native call stack.
pub fn check_stack_safety(depth: u64) -> Result<(), LawViolation> {
    let mut effect: Effect<Env, Err, i64> = Effect::of(0);
    for _ in 0..depth {
        effect = effect.chain(|n: i64| Effect::of(n + 1));
    }
    match run(effect) {
        Ok(n) if n as u64 == depth => Ok(()),
        _ => Err(LawViolation::StackUnsafe { depth }),
    }
}

/// L-9: cancelling a fiber `times` times has the same observable effect as
/// cancelling it once — no terminal callback ever fires.
pub fn check_cancel_idempotence(times: u32) -> Result<(), LawViolation> {
    let scheduler = TestScheduler::new();
    let settled = Arc::new(AtomicU32::new(0));
    let settled_writer = settled.clone();
    let effect: Effect<Env, Err, i64> = Effect::never();
    let token = execute(effect, (), scheduler.clone() as Arc<dyn Scheduler>, move |_result| {
        settled_writer.fetch_add(1, Ordering::SeqCst);
    });
    for _ in 0..times {
        token.cancel();
    }
    scheduler.drain();
    if settled.load(Ordering::SeqCst) == 0 {
        Ok(())
    } else {
        Err(LawViolation::CancelNotIdempotent { cancel_count: times })
    }
}

/// L-10: exactly one of success/failure fires per execution.
pub fn check_at_most_one_terminal(build: impl Fn() -> Effect<Env, Err, i64>) -> Result<(), LawViolation> {
    let scheduler = TestScheduler::new();
    let success_count = Arc::new(AtomicU32::new(0));
    let failure_count = Arc::new(AtomicU32::new(0));
    let s = success_count.clone();
    let fc = failure_count.clone();
    execute(build(), (), scheduler.clone() as Arc<dyn Scheduler>, move |result| match result {
        Ok(_) => {
            s.fetch_add(1, Ordering::SeqCst);
        }
        Err(_) => {
            fc.fetch_add(1, Ordering::SeqCst);
        }
    });
    scheduler.drain();
    let s_count = success_count.load(Ordering::SeqCst);
    let f_count = failure_count.load(Ordering::SeqCst);
    if s_count + f_count == 1 {
        Ok(())
    } else {
        Err(LawViolation::MultipleTerminalCallbacks { success_count: s_count, failure_count: f_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l1_pure_effect_is_referentially_transparent() {
        assert_eq!(check_referential_transparency(|| Effect::of(1).map(|n| n * 2)), Ok(()));
    }

    #[test]
    fn l2_left_identity_holds() {
        assert_eq!(check_left_identity(5, |n| Effect::of(n + 1)), Ok(()));
    }

    #[test]
    fn l3_right_identity_holds() {
        assert_eq!(check_right_identity(|| Effect::of(5).map(|n| n * 3)), Ok(()));
    }

    #[test]
    fn l4_chain_is_associative() {
        let result = check_chain_associativity(
            || Effect::of(1),
            |n| Effect::of(n + 1),
            |n| Effect::of(n * 2),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn l5_map_fuses() {
        let result = check_map_fusion(|| Effect::of(1), |n| n + 1, |n| n * 2);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn l6_catch_is_skipped_on_success() {
        assert_eq!(check_catch_skipped_on_success(7), Ok(()));
    }

    #[test]
    fn l7_catch_recovers_on_failure() {
        let result = check_catch_recovers("boom".to_string(), |failure| {
            Effect::of(match failure {
                Failure::Typed(_) => 1,
                Failure::Defect(_) => -1,
            })
        });
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn l8_stack_is_safe_at_moderate_depth() {
        assert_eq!(check_stack_safety(10_000), Ok(()));
    }

    #[test]
    #[ignore = "10^6 links is slow to build; run explicitly"]
    fn l8_stack_is_safe_at_spec_depth() {
        assert_eq!(check_stack_safety(1_000_000), Ok(()));
    }

    #[test]
    fn l9_cancel_is_idempotent() {
        assert_eq!(check_cancel_idempotence(3), Ok(()));
    }

    #[test]
    fn l10_exactly_one_terminal_callback_on_success() {
        assert_eq!(check_at_most_one_terminal(|| Effect::of(1)), Ok(()));
    }

    #[test]
    fn l10_exactly_one_terminal_callback_on_failure() {
        assert_eq!(check_at_most_one_terminal(|| Effect::reject("boom".to_string())), Ok(()));
    }
}
