use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

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
    ready: VecDeque<Ready>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
}

/// A [`Scheduler`] backed by real elapsed wall-clock time, in the manner of
/// a single-thread cooperative round-robin executor (see `juggle::Wheel`,
/// DESIGN.md): `asap` tasks land in a ready queue, `delay` tasks wait in a
/// min-heap keyed by fire time, and [`WallClockScheduler::run_until_idle`]
/// drains both, sleeping between bursts rather than busy-spinning.
pub struct WallClockScheduler {
    start: Instant,
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl WallClockScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                next_seq: 0,
            }),
            wake: Condvar::new(),
        })
    }

    /// Drains every ready task, then sleeps until the next delayed task's
    /// fire time (if any), repeating until both queues are empty. Intended
    /// to be called by the host binary's own loop; the evaluator never
    /// calls this itself, since a suspended fiber only needs its callback
    /// registered, not the loop driven.
    pub fn run_until_idle(&self) {
        loop {
            self.run_ready();

            let wait_for = {
                let inner = self.inner.lock().unwrap();
                if !inner.ready.is_empty() {
                    continue;
                }
                match inner.delayed.peek() {
                    None => return,
                    Some(Reverse(d)) => d.fire_at_ms,
                }
            };

            let now = self.now();
            if wait_for > now {
                let timeout = Duration::from_millis(wait_for - now);
                let guard = self.inner.lock().unwrap();
                let _ = self.wake.wait_timeout(guard, timeout).unwrap();
            }
            self.promote_due();
        }
    }

    fn run_ready(&self) {
        loop {
            self.promote_due();
            let next = self.inner.lock().unwrap().ready.pop_front();
            match next {
                None => return,
                Some(Ready { token, task }) => {
                    if !token.is_cancelled() {
                        trace!(id = token.id(), "keel_runtime: running wall-clock task");
                        task();
                    }
                }
            }
        }
    }

    fn promote_due(&self) {
        let now = self.now();
        let mut inner = self.inner.lock().unwrap();
        while let Some(Reverse(d)) = inner.delayed.peek() {
            if d.fire_at_ms > now {
                break;
            }
            let Reverse(d) = inner.delayed.pop().unwrap();
            inner.ready.push_back(Ready { token: d.token, task: d.task });
        }
    }
}

impl Scheduler for WallClockScheduler {
    fn asap(&self, task: Box<dyn FnOnce() + Send>) -> CancelToken {
        let token = CancelToken::new();
        self.inner.lock().unwrap().ready.push_back(Ready { token: token.clone(), task });
        self.wake.notify_all();
        token
    }

    fn delay(&self, task: Box<dyn FnOnce() + Send>, ms: u64) -> CancelToken {
        let token = CancelToken::new();
        let fire_at_ms = self.now() + ms;
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.delayed.push(Reverse(Delayed { fire_at_ms, seq, token: token.clone(), task }));
        drop(inner);
        self.wake.notify_all();
        token
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn runs_ready_tasks_in_order() {
        let sched = WallClockScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            sched.asap(Box::new(move || order.lock().unwrap().push(i)));
        }
        sched.run_until_idle();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let sched = WallClockScheduler::new();
        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = ran.clone();
        let token = sched.asap(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        token.cancel();
        sched.run_until_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delayed_task_runs_after_ready_queue_drains() {
        let sched = WallClockScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_a = order.clone();
        sched.asap(Box::new(move || order_a.lock().unwrap().push("ready")));
        let order_b = order.clone();
        sched.delay(Box::new(move || order_b.lock().unwrap().push("delayed")), 5);
        sched.run_until_idle();
        assert_eq!(*order.lock().unwrap(), vec!["ready", "delayed"]);
    }
}
