//! Stop-the-world handshake
//!
//! Mutators poll [`Safepoint::requested`] at allocation and at explicit
//! safepoints. A thread that wants to collect sets the request and waits
//! until every other attached thread is parked or inside a safe region.
//! Parked threads block until the world restarts.

use crate::log::gc_debug;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct State {
    attached: usize,
    parked: usize,
    stopping: bool,
}

/// Mutator rendezvous
#[derive(Debug, Default)]
pub struct Safepoint {
    state: Mutex<State>,
    cond: Condvar,
    requested: AtomicBool,
}

impl Safepoint {
    /// Create a safepoint with no attached threads
    pub fn new() -> Self {
        Self::default()
    }

    /// Is a stop requested
    #[inline]
    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Count a new mutator; waits out a running pause
    pub fn attach(&self) {
        let mut state = self.state.lock();
        while state.stopping {
            self.cond.wait(&mut state);
        }
        state.attached += 1;
    }

    /// Stop counting a mutator
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.attached -= 1;
        self.cond.notify_all();
    }

    /// Block until the current pause ends
    pub fn park(&self) {
        let mut state = self.state.lock();
        if !state.stopping {
            return;
        }
        state.parked += 1;
        self.cond.notify_all();
        while state.stopping {
            self.cond.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Declare that this thread will not touch the heap until
    /// [`Safepoint::leave_safe_region`]
    pub fn enter_safe_region(&self) {
        let mut state = self.state.lock();
        state.parked += 1;
        self.cond.notify_all();
    }

    /// Resume heap access, waiting out a running pause
    pub fn leave_safe_region(&self) {
        let mut state = self.state.lock();
        while state.stopping {
            self.cond.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Request a stop and wait until every other attached thread is parked.
    /// `requester_attached` says whether the caller itself is counted.
    pub fn stop_world(&self, requester_attached: bool) {
        let mut state = self.state.lock();
        debug_assert!(!state.stopping, "nested stop-the-world");
        state.stopping = true;
        self.requested.store(true, Ordering::Release);
        let own = usize::from(requester_attached);
        while state.parked + own < state.attached {
            self.cond.wait(&mut state);
        }
        gc_debug!(attached = state.attached, "world stopped");
    }

    /// Release every parked thread
    pub fn restart_world(&self) {
        let mut state = self.state.lock();
        state.stopping = false;
        self.requested.store(false, Ordering::Release);
        self.cond.notify_all();
    }

    /// Attached thread count
    pub fn attached(&self) -> usize {
        self.state.lock().attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_stop_waits_for_parking() {
        let safepoint = Arc::new(Safepoint::new());
        let progress = Arc::new(AtomicUsize::new(0));
        safepoint.attach(); // the collecting thread
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let safepoint = Arc::clone(&safepoint);
                let progress = Arc::clone(&progress);
                safepoint.attach();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if safepoint.requested() {
                            safepoint.park();
                        }
                        progress.fetch_add(1, Ordering::Relaxed);
                        std::thread::sleep(Duration::from_micros(50));
                    }
                    safepoint.detach();
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(2));
        safepoint.stop_world(true);
        let frozen = progress.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(progress.load(Ordering::Relaxed), frozen);
        safepoint.restart_world();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(progress.load(Ordering::Relaxed), 600);
        assert_eq!(safepoint.attached(), 1);
    }

    #[test]
    fn test_safe_region_counts_as_parked() {
        let safepoint = Safepoint::new();
        safepoint.attach();
        safepoint.attach();
        safepoint.enter_safe_region();
        // returns at once: the other thread is in a safe region
        safepoint.stop_world(true);
        safepoint.restart_world();
        safepoint.leave_safe_region();
        assert!(!safepoint.requested());
    }
}
