// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-use countdown latch.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::condvar::ConditionVariable;
use crate::error::Interrupted;

/// Lets threads wait until `count_down` has been called `count` times.
#[derive(Debug, Default)]
pub struct CountdownLatch {
    count: Mutex<usize>,
    cv: ConditionVariable,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: ConditionVariable::new(),
        }
    }

    /// Decrement the count; reaching zero releases every waiter.
    /// Extra calls after zero are no-ops.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    pub fn wait(&self) -> Result<(), Interrupted> {
        let mut count = self.count.lock();
        self.cv.wait_while(&mut count, |c| *c > 0)
    }

    /// `Ok(false)` if the count is still positive at the deadline.
    pub fn wait_until(&self, deadline: Instant) -> Result<bool, Interrupted> {
        let mut count = self.count.lock();
        let status = self.cv.wait_while_until(&mut count, deadline, |c| *c > 0)?;
        Ok(!status.timed_out())
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        let mut count = self.count.lock();
        let status = self.cv.wait_while_for(&mut count, timeout, |c| *c > 0)?;
        Ok(!status.timed_out())
    }
}
