//! Fence cycles signalling completion of submitted GPU work.
//!
//! A [`FenceCycle`] tracks a single submit -> signal cycle. Cycles can be
//! chained so that waiting on the newest cycle transitively waits on older
//! ones, which lets a buffer carry a single `Option<Arc<FenceCycle>>` across
//! successive executions that touch it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A one-shot completion signal for a batch of submitted GPU work.
pub struct FenceCycle {
    signalled: AtomicBool,
    /// Older cycles that must also complete before this one is considered
    /// waited. Doubles as the condvar mutex.
    chained: Mutex<Vec<Arc<FenceCycle>>>,
    condvar: Condvar,
}

impl FenceCycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            signalled: AtomicBool::new(false),
            chained: Mutex::new(Vec::new()),
            condvar: Condvar::new(),
        })
    }

    /// Marks the cycle as complete and wakes all waiters.
    ///
    /// Called by the execution engine once the associated submission has
    /// retired on the GPU timeline.
    pub fn signal(&self) {
        let _chained = self.chained.lock();
        self.signalled.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Force-signals the cycle and drops any chained cycles without waiting
    /// on them. Used when the associated submission is abandoned.
    pub fn cancel(&self) {
        let mut chained = self.chained.lock();
        chained.clear();
        self.signalled.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Chains an older cycle onto this one so that it is waited on (and
    /// polled) transitively.
    pub fn chain_cycle(&self, older: Arc<FenceCycle>) {
        self.chained.lock().push(older);
    }

    /// Blocks until this cycle and everything chained onto it has signalled.
    pub fn wait(&self) {
        // Chained cycles are older submissions; drain them first. The list is
        // cloned so concurrent waiters all observe the full chain.
        let chained = self.chained.lock().clone();
        for cycle in chained {
            cycle.wait();
        }

        let mut guard = self.chained.lock();
        while !self.signalled.load(Ordering::Acquire) {
            self.condvar.wait(&mut guard);
        }
        guard.clear();
    }

    /// Returns whether this cycle and everything chained onto it has
    /// signalled, without blocking.
    pub fn poll(&self) -> bool {
        if !self.signalled.load(Ordering::Acquire) {
            return false;
        }
        let mut chained = self.chained.lock();
        if chained.iter().all(|cycle| cycle.poll()) {
            chained.clear();
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for FenceCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceCycle")
            .field("signalled", &self.signalled.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn poll_reflects_signal() {
        let cycle = FenceCycle::new();
        assert!(!cycle.poll());
        cycle.signal();
        assert!(cycle.poll());
    }

    #[test]
    fn wait_blocks_until_signalled() {
        let cycle = FenceCycle::new();
        let waiter = {
            let cycle = Arc::clone(&cycle);
            std::thread::spawn(move || cycle.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        cycle.signal();
        waiter.join().unwrap();
    }

    #[test]
    fn chained_cycles_gate_poll_and_wait() {
        let old = FenceCycle::new();
        let new = FenceCycle::new();
        new.chain_cycle(Arc::clone(&old));

        new.signal();
        assert!(!new.poll(), "chained cycle still pending");

        old.signal();
        assert!(new.poll());
        new.wait();
    }

    #[test]
    fn cancel_releases_waiters_and_drops_chain() {
        let old = FenceCycle::new();
        let new = FenceCycle::new();
        new.chain_cycle(old);

        new.cancel();
        assert!(new.poll());
        new.wait();
    }
}
