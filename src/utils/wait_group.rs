use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Counter-style wait group: `add` before scheduling work, `done` when a unit
/// completes, `wait` blocks until the counter reaches zero.
///
/// This is the quiescence primitive behind `Channel::wait_for_quiescence`:
/// every scheduled delivery adds one, every completed callback signals done.
/// Cloning shares the same counter.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupState>,
}

struct WaitGroupState {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitGroupState {
                count: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Register `n` units of pending work.
    pub fn add(&self, n: usize) {
        let mut count = self.inner.count.lock();
        *count += n;
    }

    /// Mark one unit of work complete. The counter never goes below zero.
    pub fn done(&self) {
        let mut count = self.inner.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.cond.notify_all();
        }
    }

    /// Block until all registered work has completed.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.cond.wait(&mut count);
        }
    }

    /// Current number of pending units. Racy by nature; for diagnostics.
    pub fn pending(&self) -> usize {
        *self.inner.count.lock()
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}
