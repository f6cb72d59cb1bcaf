//! Algebraic-law and end-to-end scenario checks for the effect system
//! defined by `keel-types`/`keel-runtime`, in the same formally-numbered
//! violation-catalogue style used elsewhere in this workspace.
//!
//! `laws` checks the ten properties every `Effect` must satisfy regardless
//! of how it was built (referential transparency, the chain/map identities,
//! catch's success/failure split, stack safety, cancel idempotence, exactly-
//! once delivery). `scenarios` runs the seven worked end-to-end programs
//! and checks their observable outcome against a fresh `TestScheduler`.
//! `stream_checks` does the same for `Stream`'s combinators and sources.

pub mod error;
pub mod laws;
pub mod scenarios;
pub mod stream_checks;

pub use error::{LawViolation, ScenarioViolation, StreamViolation};
