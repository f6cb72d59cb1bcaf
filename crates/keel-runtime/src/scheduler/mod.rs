//! Concrete [`keel_types::Scheduler`] implementations. The evaluator only
//! ever depends on the trait; these are the two schedulers the rest of the
//! workspace actually constructs.

mod test_scheduler;
mod wall_clock;

pub use test_scheduler::TestScheduler;
pub use wall_clock::WallClockScheduler;
