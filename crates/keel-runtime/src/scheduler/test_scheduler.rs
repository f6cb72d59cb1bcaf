use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex};

use keel_types::{CancelToken, Scheduler};
use tracing::trace;

type Task = Box<dyn FnOnce() + Send>;

struct Ready {
    token: CancelToken,
    task: Task,
}

struct Delayed {
    fire_at_ms: u64,
    seq: u64,
    token: CancelToken,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at_ms == other.fire_at_ms && self.seq == other.seq
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.fire_at_ms, self.seq).cmp(&(other.fire_at_ms, other.seq))
    }
}

struct Inner {
    now_ms: u64,
    ready: VecDeque<Ready>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
}

/// A [`Scheduler`] whose clock only moves when told to. Never touches real
/// time, so tests get deterministic, replayable orderings for `delay`,
/// `timeout`, and `race` instead of depending on the host machine's actual
/// scheduling latency. This is what `keel-invariants` and
/// [`crate::unsafe_execute_sync`] drive every effect with.
pub struct TestScheduler {
    inner: Mutex<Inner>,
}

impl TestScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                now_ms: 0,
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    /// Runs every currently-ready task, including any further `asap` tasks
    /// those tasks themselves schedule, without advancing the clock or
    /// touching delayed tasks.
    pub fn drain(&self) {
        loop {
            let next = self.inner.lock().unwrap().ready.pop_front();
            match next {
                None => return,
                Some(Ready { token, task }) => {
                    if !token.is_cancelled() {
                        trace!(id = token.id(), "keel_runtime: running test-scheduler task");
                        task();
                    }
                }
            }
        }
    }

    /// Moves the logical clock forward by `ms`, promoting and running any
    /// delayed task whose fire time falls at or before the new time, in
    /// fire-time order, draining the ready queue after each promotion so a
    /// task's own `asap` follow-ups run before the next delayed task fires.
    pub fn advance(&self, ms: u64) {
        self.drain();
        let target = self.inner.lock().unwrap().now_ms + ms;
        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();
                match inner.delayed.peek() {
                    Some(Reverse(d)) if d.fire_at_ms <= target => {
                        let Reverse(d) = inner.delayed.pop().unwrap();
                        inner.now_ms = d.fire_at_ms;
                        Some(d)
                    }
                    _ => None,
                }
            };
            match due {
                Some(d) => {
                    self.inner.lock().unwrap().ready.push_back(Ready { token: d.token, task: d.task });
                    self.drain();
                }
                None => break,
            }
        }
        self.inner.lock().unwrap().now_ms = target;
    }
}

impl Scheduler for TestScheduler {
    fn asap(&self, task: Box<dyn FnOnce() + Send>) -> CancelToken {
        let token = CancelToken::new();
        self.inner.lock().unwrap().ready.push_back(Ready { token: token.clone(), task });
        token
    }

    fn delay(&self, task: Box<dyn FnOnce() + Send>, ms: u64) -> CancelToken {
        let token = CancelToken::new();
        let mut inner = self.inner.lock().unwrap();
        let fire_at_ms = inner.now_ms + ms;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.delayed.push(Reverse(Delayed { fire_at_ms, seq, token: token.clone(), task }));
        token
    }

    fn now(&self) -> u64 {
        self.inner.lock().unwrap().now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_runs_due_delayed_tasks_in_fire_order() {
        let sched = TestScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = order.clone();
        sched.delay(Box::new(move || order_a.lock().unwrap().push(20)), 20);
        let order_b = order.clone();
        sched.delay(Box::new(move || order_b.lock().unwrap().push(10)), 10);
        sched.advance(25);
        assert_eq!(*order.lock().unwrap(), vec![10, 20]);
        assert_eq!(sched.now(), 25);
    }

    #[test]
    fn tasks_scheduled_beyond_the_advance_window_stay_pending() {
        let sched = TestScheduler::new();
        let ran = Arc::new(Mutex::new(false));
        let ran_clone = ran.clone();
        sched.delay(Box::new(move || *ran_clone.lock().unwrap() = true), 100);
        sched.advance(10);
        assert!(!*ran.lock().unwrap());
        sched.advance(90);
        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn drain_does_not_advance_the_clock() {
        let sched = TestScheduler::new();
        sched.asap(Box::new(|| {}));
        sched.drain();
        assert_eq!(sched.now(), 0);
    }
}
