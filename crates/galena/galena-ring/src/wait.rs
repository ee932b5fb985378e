//! Wait strategies: how a stalled party observes sequence progress.
//!
//! A producer that has run out of free slots must wait until the slowest
//! reader advances. How it waits is a latency/CPU trade-off with no effect
//! on correctness, so the policy is pluggable: from burning a core on a
//! tight load loop down to parking on a condition variable.
//!
//! All strategies share one contract: [`WaitStrategy::wait_for`] observes
//! `min(cursor, dependents)` and tries to outwait it reaching `required`.
//! Strategies are allowed to return before the condition holds (a timeout,
//! a spurious wake-up); callers loop until the predicate they care about
//! is actually true.

use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::sequence::{Sequence, SequenceGroup};

/// How long the blocking strategies park between re-checks. Consumers
/// advance their sequences without signalling anybody, so a parked
/// producer must wake on its own to observe their progress.
const RECHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Observes the gating value: the slowest of the dependent sequences,
/// bounded above by the cursor. With no dependents this is the cursor
/// itself.
#[inline]
fn observed(cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
    dependents.minimum_or(cursor.value())
}

/// Policy for waiting until a sequence reaches a required value.
pub trait WaitStrategy: Send + Sync + fmt::Debug {
    /// Waits until `min(cursor, min(dependents)) >= required` and returns
    /// the observed value. Non-blocking strategies may return earlier
    /// observations; callers re-check and re-enter.
    fn wait_for(&self, required: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64;

    /// Wakes every thread parked inside `wait_for`. A no-op for the
    /// strategies that never park.
    fn signal_all_when_blocking(&self) {}
}

/// Tight load loop. Lowest latency, one core pinned at 100%.
#[derive(Debug, Default)]
pub struct BusySpinWaitStrategy;

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(&self, required: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        loop {
            let seq = observed(cursor, dependents);
            if seq >= required {
                return seq;
            }
            std::hint::spin_loop();
        }
    }
}

/// Bounded exponential back-off built on the architecture pause hint.
/// Doubles the pause burst on every miss, capped well below a scheduler
/// quantum so the waiter stays on-core.
#[derive(Debug, Default)]
pub struct SpinLoopWaitStrategy;

impl WaitStrategy for SpinLoopWaitStrategy {
    fn wait_for(&self, required: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        let mut shift = 0u32;
        loop {
            let seq = observed(cursor, dependents);
            if seq >= required {
                return seq;
            }
            for _ in 0..(1u32 << shift) {
                std::hint::spin_loop();
            }
            if shift < 6 {
                shift += 1;
            }
        }
    }
}

/// Spins a fixed number of times, then yields the scheduler slot on every
/// further miss.
#[derive(Debug)]
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    pub fn new() -> Self {
        Self { spin_tries: 100 }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(&self, required: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        let mut counter = self.spin_tries;
        loop {
            let seq = observed(cursor, dependents);
            if seq >= required {
                return seq;
            }
            if counter > 0 {
                counter -= 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// Spin, then yield, then 1 ns sleeps. The default strategy: negligible
/// CPU cost while idle, still sub-microsecond pickup under load.
#[derive(Debug)]
pub struct SleepingWaitStrategy {
    retries: i32,
}

impl SleepingWaitStrategy {
    const DEFAULT_RETRIES: i32 = 200;

    pub fn new() -> Self {
        Self {
            retries: Self::DEFAULT_RETRIES,
        }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(&self, required: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        let mut counter = self.retries;
        loop {
            let seq = observed(cursor, dependents);
            if seq >= required {
                return seq;
            }
            if counter > 100 {
                counter -= 1;
                std::hint::spin_loop();
            } else if counter > 0 {
                counter -= 1;
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_nanos(1));
            }
        }
    }
}

/// Parks on a condition variable. Producers signal on every publish;
/// consumer progress is picked up by the timed re-check.
#[derive(Debug, Default)]
pub struct BlockingWaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl BlockingWaitStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(&self, required: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        loop {
            let seq = observed(cursor, dependents);
            if seq >= required {
                return seq;
            }
            let mut guard = self.lock.lock();
            // Re-check under the lock so a signal between the check above
            // and the park below is not lost.
            if observed(cursor, dependents) >= required {
                continue;
            }
            self.condvar.wait_for(&mut guard, RECHECK_INTERVAL);
        }
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}

/// As [`BlockingWaitStrategy`], but gives up after `timeout` and returns
/// whatever value was observed at that point. The caller sees an
/// observation below `required` and decides whether to re-enter.
#[derive(Debug)]
pub struct TimeoutBlockingWaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
    timeout: Duration,
}

impl TimeoutBlockingWaitStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            timeout,
        }
    }
}

impl WaitStrategy for TimeoutBlockingWaitStrategy {
    fn wait_for(&self, required: i64, cursor: &Sequence, dependents: &SequenceGroup) -> i64 {
        let deadline = std::time::Instant::now() + self.timeout;
        loop {
            let seq = observed(cursor, dependents);
            if seq >= required {
                return seq;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return seq;
            }
            let mut guard = self.lock.lock();
            if observed(cursor, dependents) >= required {
                continue;
            }
            self.condvar
                .wait_for(&mut guard, (deadline - now).min(RECHECK_INTERVAL));
        }
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn strategies() -> Vec<Arc<dyn WaitStrategy>> {
        vec![
            Arc::new(BusySpinWaitStrategy),
            Arc::new(SpinLoopWaitStrategy),
            Arc::new(YieldingWaitStrategy::new()),
            Arc::new(SleepingWaitStrategy::new()),
            Arc::new(BlockingWaitStrategy::new()),
        ]
    }

    #[test]
    fn returns_immediately_when_condition_already_holds() {
        let cursor = Sequence::new(5);
        let dependents = SequenceGroup::new();
        for strategy in strategies() {
            assert_eq!(strategy.wait_for(3, &cursor, &dependents), 5);
        }
    }

    #[test]
    fn observes_cursor_advance_from_another_thread() {
        for strategy in strategies() {
            let cursor = Arc::new(Sequence::default());
            let dependents = Arc::new(SequenceGroup::new());

            let waiter = {
                let cursor = Arc::clone(&cursor);
                let dependents = Arc::clone(&dependents);
                let strategy = Arc::clone(&strategy);
                thread::spawn(move || strategy.wait_for(0, &cursor, &dependents))
            };

            thread::sleep(Duration::from_millis(10));
            cursor.set(0);
            strategy.signal_all_when_blocking();
            assert!(waiter.join().unwrap() >= 0);
        }
    }

    #[test]
    fn gating_follows_the_slowest_dependent() {
        let cursor = Sequence::new(10);
        let dependents = SequenceGroup::new();
        let slow = Arc::new(Sequence::default());
        dependents.add(&Sequence::new(2), Arc::clone(&slow));

        let strategy = BusySpinWaitStrategy;
        assert_eq!(strategy.wait_for(2, &cursor, &dependents), 2);

        slow.set(7);
        assert_eq!(strategy.wait_for(7, &cursor, &dependents), 7);
    }

    #[test]
    fn timeout_strategy_returns_early_observation() {
        let cursor = Sequence::default();
        let dependents = SequenceGroup::new();
        let strategy = TimeoutBlockingWaitStrategy::new(Duration::from_millis(5));

        let start = std::time::Instant::now();
        let seq = strategy.wait_for(100, &cursor, &dependents);
        assert!(seq < 100);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
