//! Parallel drain of the gray queue
//!
//! A pause starts a fixed set of collector threads once, runs any number of
//! drain phases on them, and joins them at the end. Threads share work in
//! whole gray sections through a distribution queue. A phase ends when the
//! distribution queue is empty and every thread is idle at the same time;
//! both facts are checked under one lock, so no section can slip in between.

use crate::address::Address;
use crate::gray::{GrayQueue, GraySection};
use crate::log::gc_debug;
use parking_lot::{Condvar, Mutex};

/// Per-phase scanning logic shared by every collector thread
pub trait GrayScanner: Sync {
    /// State owned by one thread for the whole pause
    type Worker: Send + GrayWorker;

    /// Create the state of thread `id`
    fn new_worker(&self, id: usize) -> Self::Worker;

    /// Scan one gray object, pushing newly discovered objects on the
    /// worker's queue
    fn scan(&self, worker: &mut Self::Worker, obj: Address);
}

/// Access to a worker's private queue
pub trait GrayWorker {
    /// The private gray queue
    fn gray_queue(&mut self) -> &mut GrayQueue;
}

struct DrainState {
    sections: Vec<Box<GraySection>>,
    idle: usize,
    exited: usize,
    done: bool,
    epoch: u64,
    shutdown: bool,
}

/// Distribution queue plus termination detection
pub struct SharedGrayQueue {
    threads: usize,
    state: Mutex<DrainState>,
    cond: Condvar,
}

impl SharedGrayQueue {
    /// Queue for `threads` participants
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            state: Mutex::new(DrainState {
                sections: Vec::new(),
                idle: 0,
                exited: 0,
                done: true,
                epoch: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn publish(&self, sections: Vec<Box<GraySection>>) {
        if sections.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.sections.extend(sections);
        self.cond.notify_all();
    }

    /// Drain until global quiescence
    fn participate<S: GrayScanner>(&self, scanner: &S, worker: &mut S::Worker) {
        loop {
            while let Some(obj) = worker.gray_queue().pop() {
                scanner.scan(worker, obj);
                if self.threads > 1 && worker.gray_queue().section_count() > 1 {
                    let spare = worker.gray_queue().take_full_sections();
                    self.publish(spare);
                }
            }

            let mut state = self.state.lock();
            loop {
                if let Some(section) = state.sections.pop() {
                    drop(state);
                    worker.gray_queue().add_section(section);
                    break;
                }
                if state.done {
                    state.exited += 1;
                    self.cond.notify_all();
                    return;
                }
                state.idle += 1;
                if state.idle == self.threads {
                    state.done = true;
                    state.exited += 1;
                    self.cond.notify_all();
                    return;
                }
                self.cond.wait(&mut state);
                state.idle -= 1;
            }
        }
    }

    /// Worker thread body: run every phase the coordinator starts
    fn worker_loop<S: GrayScanner>(&self, scanner: &S, worker: &mut S::Worker) {
        let mut seen = 0;
        loop {
            {
                let mut state = self.state.lock();
                while state.epoch == seen && !state.shutdown {
                    self.cond.wait(&mut state);
                }
                if state.shutdown {
                    return;
                }
                seen = state.epoch;
            }
            self.participate(scanner, worker);
        }
    }

    /// Coordinator side of one phase: share its queue, drain alongside the
    /// workers, wait until every thread has left the phase
    fn run_phase<S: GrayScanner>(&self, scanner: &S, worker: &mut S::Worker) {
        {
            let mut state = self.state.lock();
            let sections = worker.gray_queue().take_full_sections();
            state.sections.extend(sections);
            state.idle = 0;
            state.exited = 0;
            state.done = false;
            state.epoch += 1;
            self.cond.notify_all();
        }
        self.participate(scanner, worker);
        let mut state = self.state.lock();
        while state.exited < self.threads {
            self.cond.wait(&mut state);
        }
        debug_assert!(state.sections.is_empty());
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }
}

/// Handle given to the pause body for running drain phases
pub struct Drainer<'a, S: GrayScanner> {
    shared: &'a SharedGrayQueue,
    scanner: &'a S,
    phases: usize,
}

impl<S: GrayScanner> Drainer<'_, S> {
    /// Drain `worker`'s queue and everything reachable from it on all
    /// collector threads
    pub fn drain(&mut self, worker: &mut S::Worker) {
        self.phases += 1;
        if self.shared.threads == 1 {
            while let Some(obj) = worker.gray_queue().pop() {
                self.scanner.scan(worker, obj);
            }
        } else {
            self.shared.run_phase(self.scanner, worker);
        }
    }

    /// Number of phases run so far
    pub fn phases(&self) -> usize {
        self.phases
    }
}

/// Fixed-size pool of collector threads for one pause
#[derive(Clone, Copy, Debug)]
pub struct WorkerPool {
    threads: usize,
}

impl WorkerPool {
    /// Pool of `threads` collector threads, counting the coordinator
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Number of threads
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run a pause. `body` gets the coordinator's worker state and a
    /// [`Drainer`]; helper threads live until `body` returns. Returns the
    /// body's result and every worker state, coordinator first.
    pub fn run<S, R>(
        &self,
        scanner: &S,
        body: impl FnOnce(&mut S::Worker, &mut Drainer<'_, S>) -> R,
    ) -> (R, Vec<S::Worker>)
    where
        S: GrayScanner,
    {
        let shared = SharedGrayQueue::new(self.threads);
        let mut coordinator = scanner.new_worker(0);
        let mut drainer = Drainer {
            shared: &shared,
            scanner,
            phases: 0,
        };

        if self.threads == 1 {
            let result = body(&mut coordinator, &mut drainer);
            return (result, vec![coordinator]);
        }

        let outcome = crossbeam_utils::thread::scope(|scope| {
            let handles: Vec<_> = (1..self.threads)
                .map(|id| {
                    let shared = &shared;
                    scope.spawn(move |_| {
                        let mut worker = scanner.new_worker(id);
                        shared.worker_loop(scanner, &mut worker);
                        worker
                    })
                })
                .collect();

            let result = body(&mut coordinator, &mut drainer);
            shared.shutdown();
            gc_debug!(
                threads = self.threads,
                phases = drainer.phases(),
                "joining collector threads"
            );

            let mut workers = vec![coordinator];
            for handle in handles {
                match handle.join() {
                    Ok(worker) => workers.push(worker),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            (result, workers)
        });
        match outcome {
            Ok(done) => done,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scans a synthetic binary tree: node n has children 2n+1 and 2n+2
    struct TreeScanner {
        nodes: usize,
        scanned: AtomicUsize,
    }

    struct TreeWorker {
        queue: GrayQueue,
        seen: Vec<usize>,
    }

    impl GrayWorker for TreeWorker {
        fn gray_queue(&mut self) -> &mut GrayQueue {
            &mut self.queue
        }
    }

    impl GrayScanner for TreeScanner {
        type Worker = TreeWorker;

        fn new_worker(&self, _id: usize) -> TreeWorker {
            TreeWorker {
                queue: GrayQueue::new(),
                seen: Vec::new(),
            }
        }

        fn scan(&self, worker: &mut TreeWorker, obj: Address) {
            let n = obj.as_usize();
            self.scanned.fetch_add(1, Ordering::Relaxed);
            worker.seen.push(n);
            for child in [2 * n + 1, 2 * n + 2] {
                if child < self.nodes {
                    worker.queue.push(Address::from_usize(child));
                }
            }
        }
    }

    fn run_tree(threads: usize, nodes: usize) -> (usize, Vec<usize>) {
        let scanner = TreeScanner {
            nodes,
            scanned: AtomicUsize::new(0),
        };
        let pool = WorkerPool::new(threads);
        let (phases, workers) = pool.run(&scanner, |worker, drainer| {
            worker.queue.push(Address::from_usize(0));
            drainer.drain(worker);
            // a second phase after the first reached quiescence
            worker.queue.push(Address::from_usize(0));
            drainer.drain(worker);
            drainer.phases()
        });
        assert_eq!(phases, 2);
        assert_eq!(workers.len(), threads);
        let mut seen: Vec<usize> = workers.into_iter().flat_map(|w| w.seen).collect();
        seen.sort_unstable();
        (scanner.scanned.load(Ordering::Relaxed), seen)
    }

    #[test]
    fn test_serial_drain() {
        let (scanned, seen) = run_tree(1, 1000);
        assert_eq!(scanned, 2000);
        assert_eq!(seen.len(), 2000);
    }

    #[test]
    fn test_parallel_drain_visits_everything_once_per_phase() {
        let (scanned, seen) = run_tree(4, 50_000);
        assert_eq!(scanned, 100_000);
        let mut expected: Vec<usize> = (0..50_000).chain(0..50_000).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
