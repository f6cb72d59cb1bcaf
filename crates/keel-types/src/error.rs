use std::fmt;

/// A synchronous panic captured from a user-supplied closure — a "defect".
///
/// Rust has no exceptions; a defect here is a caught [`std::panic`] from a
/// `map`/`chain`/`catch`/`from`-registration closure, carried on the error
/// channel so it can be recovered with `catch` instead of unwinding the whole
/// fiber (and, if nothing catches it, reaching `on_failure` like any other
/// failure — never a hard process abort).
#[derive(Debug, Clone)]
pub struct Defect {
    pub message: String,
}

impl Defect {
    /// Builds a `Defect` from a `std::panic::catch_unwind` payload.
    pub fn from_panic_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic payload was not a string".to_string()
        };
        Self { message }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "defect: {}", self.message)
    }
}

impl std::error::Error for Defect {}

/// The unified failure channel an effect actually completes with.
///
/// Spec §7 distinguishes *typed failures* (produced by `reject` or a failing
/// `Async` callback) from *defects* (synchronous panics caught inside a user
/// closure). Both flow the same `catch`/`on_failure` path, tagged so a
/// handler can tell them apart — this is the Rust realization of the
/// original's "arbitrary thrown values as errors"; Rust has no
/// dynamically-typed exception value, so the two cases are a closed sum
/// instead of a single dynamic channel.
#[derive(Debug, Clone)]
pub enum Failure<E> {
    Typed(E),
    Defect(Defect),
}

impl<E> Failure<E> {
    pub fn typed(self) -> Option<E> {
        match self {
            Failure::Typed(e) => Some(e),
            Failure::Defect(_) => None,
        }
    }

    pub fn is_defect(&self) -> bool {
        matches!(self, Failure::Defect(_))
    }
}

impl<E: fmt::Display> fmt::Display for Failure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Typed(e) => write!(f, "{e}"),
            Failure::Defect(d) => write!(f, "{d}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Failure<E> {}
