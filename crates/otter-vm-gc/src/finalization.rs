//! Finalization queue
//!
//! Objects registered for finalization are tracked weakly. After the graph
//! and the ephemerons reach a fixed point, every registered object that was
//! not reached moves to the ready list and is traced again so that it and
//! everything it references survive until its finalizer has run. Ready
//! objects are roots until the host takes them.

use crate::address::Address;
use crate::trace::{TraceEnv, TraceWorker};

/// Registered and ready-to-run finalizable objects
#[derive(Default, Debug)]
pub struct FinalizerQueue {
    registered: Vec<Address>,
    ready: Vec<Address>,
}

impl FinalizerQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `obj`. Registering an object twice tracks it once.
    pub fn register(&mut self, obj: Address) {
        if !self.registered.contains(&obj) {
            self.registered.push(obj);
        }
    }

    /// Stop tracking `obj`. Returns `true` if it was registered.
    pub fn unregister(&mut self, obj: Address) -> bool {
        let before = self.registered.len();
        self.registered.retain(|o| *o != obj);
        before != self.registered.len()
    }

    /// Objects whose finalizers may now run
    pub fn take_ready(&mut self) -> Vec<Address> {
        std::mem::take(&mut self.ready)
    }

    /// Number of registered objects
    pub fn registered_len(&self) -> usize {
        self.registered.len()
    }

    /// Number of ready objects
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Trace the ready list as roots
    pub(crate) fn scan_ready(&mut self, env: &TraceEnv<'_>, worker: &mut TraceWorker) {
        for obj in &mut self.ready {
            // SAFETY: ready entries are object starts kept alive by this list
            *obj = unsafe { env.trace_value(*obj, worker) };
        }
    }

    /// Move every unreached registered object to the ready list and
    /// resurrect it. Returns the number of objects moved.
    pub(crate) fn process(&mut self, env: &TraceEnv<'_>, worker: &mut TraceWorker) -> usize {
        let mut moved = 0;
        let ready = &mut self.ready;
        self.registered.retain_mut(|obj| match env.live_address(*obj) {
            Some(live) => {
                *obj = live;
                true
            }
            None => {
                // SAFETY: registered entries are object starts
                ready.push(unsafe { env.trace_value(*obj, worker) });
                moved += 1;
                false
            }
        });
        moved
    }
}
