// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Unfair counting semaphore.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::CountingSemaphore;
use crate::condvar::{ConditionVariable, WaitStatus};
use crate::error::Interrupted;

#[derive(Debug, Default)]
struct State {
    value: usize,
    /// Acquirers parked on the condition variable.
    waiting: usize,
    /// Wakeups issued but not yet observed by a waiter.
    notified: usize,
}

impl State {
    fn take(&mut self) -> bool {
        if self.value > 0 {
            self.value -= 1;
            true
        } else {
            false
        }
    }
}

/// Counting semaphore built on a mutex and a [`ConditionVariable`].
///
/// A released unit may be taken by any thread, including one that arrives
/// after others started waiting. Use [`FairSemaphore`](super::FairSemaphore)
/// for arrival-order grants.
#[derive(Debug, Default)]
pub struct Semaphore {
    state: Mutex<State>,
    cv: ConditionVariable,
}

impl Semaphore {
    pub fn new(desired: usize) -> Self {
        Self {
            state: Mutex::new(State {
                value: desired,
                ..State::default()
            }),
            cv: ConditionVariable::new(),
        }
    }

    /// Semaphore holding at most one unit in normal use.
    pub fn binary(available: bool) -> Self {
        Self::new(usize::from(available))
    }

    pub const fn max() -> usize {
        <Self as CountingSemaphore>::MAX
    }

    pub fn acquire(&self) -> Result<(), Interrupted> {
        self.acquire_until(None).map(|_| ())
    }

    pub fn try_acquire(&self) -> bool {
        self.state.lock().take()
    }

    pub fn try_acquire_until(&self, deadline: Instant) -> Result<bool, Interrupted> {
        self.acquire_until(Some(deadline))
    }

    pub fn try_acquire_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        CountingSemaphore::try_acquire_for(self, timeout)
    }

    pub fn release(&self, update: usize) {
        let mut state = self.state.lock();
        state.value = state.value.saturating_add(update);
        self.wake(&mut state);
    }

    pub fn available(&self) -> usize {
        self.state.lock().value
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> Result<bool, Interrupted> {
        let mut state = self.state.lock();
        if state.take() {
            return Ok(true);
        }
        state.waiting += 1;
        loop {
            let woke = match deadline {
                Some(deadline) => self.cv.wait_until(&mut state, deadline),
                None => self.cv.wait(&mut state).map(|()| WaitStatus::Notified),
            };
            state.notified = state.notified.saturating_sub(1);
            match woke {
                Ok(status) => {
                    if state.take() {
                        state.waiting -= 1;
                        return Ok(true);
                    }
                    if status.timed_out() {
                        state.waiting -= 1;
                        self.wake(&mut state);
                        return Ok(false);
                    }
                }
                Err(interrupted) => {
                    state.waiting -= 1;
                    self.wake(&mut state);
                    return Err(interrupted);
                }
            }
        }
    }

    /// Issue wakeups for units that no pending wakeup already covers.
    fn wake(&self, state: &mut State) {
        let uncovered = state.waiting.saturating_sub(state.notified);
        let n = state.value.min(uncovered);
        state.notified += n;
        for _ in 0..n {
            self.cv.notify_one();
        }
    }
}

impl CountingSemaphore for Semaphore {
    fn new(desired: usize) -> Self {
        Semaphore::new(desired)
    }

    fn acquire(&self) -> Result<(), Interrupted> {
        Semaphore::acquire(self)
    }

    fn try_acquire(&self) -> bool {
        Semaphore::try_acquire(self)
    }

    fn try_acquire_until(&self, deadline: Instant) -> Result<bool, Interrupted> {
        Semaphore::try_acquire_until(self, deadline)
    }

    fn release(&self, update: usize) {
        Semaphore::release(self, update)
    }

    fn available(&self) -> usize {
        Semaphore::available(self)
    }
}
