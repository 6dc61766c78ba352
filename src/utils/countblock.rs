use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// a counting semaphore
pub struct Countblock {
    lock: Mutex<usize>,
    cond: Condvar,
}

impl Countblock {
    pub fn new(count: usize) -> Self {
        Self {
            lock: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut c = self.lock.lock();
        *c += 1;
        self.cond.notify_one();
    }

    /// return false if nothing was posted within `timeout`
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut c = self.lock.lock();
        while *c == 0 {
            if self.cond.wait_for(&mut c, timeout).timed_out() && *c == 0 {
                return false;
            }
        }
        *c -= 1;
        true
    }
}
