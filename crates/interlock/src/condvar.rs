// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Interruptible condition variable.
//!
//! Waits take the caller's `parking_lot` mutex guard. When the waiting thread
//! was spawned through [`crate::thread`], the condition variable publishes
//! itself in the thread's spore for the duration of the wait so that
//! [`ThreadHandle::interrupt`](crate::thread::ThreadHandle::interrupt) can
//! wake it. Other threads get a plain condition variable.
//!
//! Internally the native condvar is paired with a private gate mutex. A
//! waiter takes the gate before releasing the caller's lock and checks the
//! interrupted flag while holding it; every notification takes the gate too.
//! A notification therefore lands either before the flag check or after the
//! waiter is parked, never in between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::error::Interrupted;
use crate::thread::{self, Spore};

/// How a wait ended, when it did not end with [`Interrupted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Woken by a notification (or spuriously).
    Notified,
    /// The deadline passed.
    TimedOut,
}

impl WaitStatus {
    pub fn timed_out(self) -> bool {
        self == WaitStatus::TimedOut
    }
}

#[derive(Debug, Default)]
pub(crate) struct CondvarInner {
    gate: Mutex<()>,
    cond: Condvar,
}

impl CondvarInner {
    pub(crate) fn notify_one(&self) {
        let _gate = self.gate.lock();
        self.cond.notify_one();
    }

    pub(crate) fn notify_all(&self) {
        let _gate = self.gate.lock();
        self.cond.notify_all();
    }

    /// Release `guard`, park until notified or `deadline`, then relock `guard`.
    fn park<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
        spore: Option<&Spore>,
    ) -> Result<WaitStatus, Interrupted> {
        let mut gate = self.gate.lock();
        if spore.is_some_and(Spore::take_interrupt) {
            return Err(Interrupted::current());
        }
        // The gate is dropped inside the closure so the caller's lock is
        // always reacquired without holding it.
        let status = MutexGuard::unlocked(guard, move || {
            let status = match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut gate, deadline).timed_out() {
                        WaitStatus::TimedOut
                    } else {
                        WaitStatus::Notified
                    }
                }
                None => {
                    self.cond.wait(&mut gate);
                    WaitStatus::Notified
                }
            };
            drop(gate);
            status
        });
        if spore.is_some_and(Spore::take_interrupt) {
            return Err(Interrupted::current());
        }
        Ok(status)
    }
}

/// Keeps the condition variable published in the spore; withdraws it on drop.
struct Registration<'a> {
    spore: &'a Spore,
}

impl<'a> Registration<'a> {
    fn new(spore: &'a Spore, cv: &Arc<CondvarInner>) -> Self {
        spore.register(cv);
        Self { spore }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.spore.deregister();
    }
}

/// Condition variable whose waits can be cancelled by thread interruption.
#[derive(Debug, Default)]
pub struct ConditionVariable {
    inner: Arc<CondvarInner>,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    pub fn notify_all(&self) {
        self.inner.notify_all();
    }

    /// Block until notified.
    ///
    /// Fails without blocking if the calling thread already has a pending
    /// interruption, and fails after waking if one arrived meanwhile. Spurious
    /// wakeups are possible; use [`wait_while`](Self::wait_while) to loop on
    /// a condition.
    pub fn wait<T>(&self, guard: &mut MutexGuard<'_, T>) -> Result<(), Interrupted> {
        self.wait_inner(guard, None).map(|_| ())
    }

    /// Block while `condition` holds.
    pub fn wait_while<T, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        mut condition: F,
    ) -> Result<(), Interrupted>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            self.wait(guard)?;
        }
        Ok(())
    }

    pub fn wait_until<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Instant,
    ) -> Result<WaitStatus, Interrupted> {
        self.wait_inner(guard, Some(deadline))
    }

    pub fn wait_for<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> Result<WaitStatus, Interrupted> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(guard, deadline),
            None => self.wait(guard).map(|()| WaitStatus::Notified),
        }
    }

    /// Block while `condition` holds, giving up at `deadline`.
    ///
    /// Returns [`WaitStatus::TimedOut`] only if the condition still holds
    /// after the deadline passed. An interruption takes precedence over an
    /// expired deadline.
    pub fn wait_while_until<T, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Instant,
        mut condition: F,
    ) -> Result<WaitStatus, Interrupted>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut **guard) {
            if self.wait_until(guard, deadline)?.timed_out() {
                return Ok(if condition(&mut **guard) {
                    WaitStatus::TimedOut
                } else {
                    WaitStatus::Notified
                });
            }
        }
        Ok(WaitStatus::Notified)
    }

    pub fn wait_while_for<T, F>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
        condition: F,
    ) -> Result<WaitStatus, Interrupted>
    where
        F: FnMut(&mut T) -> bool,
    {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_while_until(guard, deadline, condition),
            None => self
                .wait_while(guard, condition)
                .map(|()| WaitStatus::Notified),
        }
    }

    fn wait_inner<T>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
    ) -> Result<WaitStatus, Interrupted> {
        let Some(spore) = thread::current_spore() else {
            return self.inner.park(guard, deadline, None);
        };
        let _registration = Registration::new(&spore, &self.inner);
        trace!("waiting on interruptible condition variable");
        self.inner.park(guard, deadline, Some(&*spore))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::thread::spawn;

    #[test]
    fn notify_wakes_plain_waiter() {
        let state = Arc::new((Mutex::new(false), ConditionVariable::new()));
        let s = Arc::clone(&state);
        let waiter = std::thread::spawn(move || {
            let (lock, cv) = &*s;
            let mut ready = lock.lock();
            cv.wait_while(&mut ready, |r| !*r).unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        *state.0.lock() = true;
        state.1.notify_all();
        waiter.join().unwrap();
    }

    #[test]
    fn timed_wait_reports_timeout() {
        let lock = Mutex::new(());
        let cv = ConditionVariable::new();
        let mut guard = lock.lock();
        let status = cv.wait_for(&mut guard, Duration::from_millis(10)).unwrap();
        assert_eq!(status, WaitStatus::TimedOut);
    }

    #[test]
    fn predicate_wait_times_out_while_condition_holds() {
        let lock = Mutex::new(0);
        let cv = ConditionVariable::new();
        let mut guard = lock.lock();
        let status = cv
            .wait_while_for(&mut guard, Duration::from_millis(10), |v| *v == 0)
            .unwrap();
        assert!(status.timed_out());
    }

    #[test]
    fn predicate_already_false_returns_immediately() {
        let lock = Mutex::new(1);
        let cv = ConditionVariable::new();
        let mut guard = lock.lock();
        let status = cv
            .wait_while_for(&mut guard, Duration::from_secs(30), |v| *v == 0)
            .unwrap();
        assert_eq!(status, WaitStatus::Notified);
    }

    #[test]
    fn interrupt_cancels_wait() {
        let state = Arc::new((Mutex::new(()), ConditionVariable::new()));
        let s = Arc::clone(&state);
        let (parked_tx, parked_rx) = mpsc::channel();
        let mut h = spawn(move || {
            let (lock, cv) = &*s;
            let mut guard = lock.lock();
            parked_tx.send(()).unwrap();
            cv.wait_while(&mut guard, |_| true)
        })
        .unwrap();
        parked_rx.recv().unwrap();
        // Holding the lock guarantees the waiter has released it inside wait.
        drop(state.0.lock());
        h.interrupt().unwrap();
        assert!(h.join().unwrap().is_err());
    }

    #[test]
    fn pending_interrupt_fails_without_blocking() {
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let mut h = spawn(move || {
            go_rx.recv().unwrap();
            let lock = Mutex::new(());
            let cv = ConditionVariable::new();
            let mut guard = lock.lock();
            let first = cv.wait(&mut guard);
            // The flag is cleared by the failed wait.
            let second = cv.wait_for(&mut guard, Duration::from_millis(5));
            (first, second)
        })
        .unwrap();
        h.interrupt().unwrap();
        go_tx.send(()).unwrap();
        let (first, second) = h.join().unwrap();
        assert!(first.is_err());
        assert_eq!(second.unwrap(), WaitStatus::TimedOut);
    }

    #[test]
    fn interruption_beats_expired_deadline() {
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let mut h = spawn(move || {
            go_rx.recv().unwrap();
            let lock = Mutex::new(());
            let cv = ConditionVariable::new();
            let mut guard = lock.lock();
            cv.wait_until(&mut guard, Instant::now())
        })
        .unwrap();
        h.interrupt().unwrap();
        go_tx.send(()).unwrap();
        assert!(h.join().unwrap().is_err());
    }

    #[test]
    fn registration_is_withdrawn_after_wait() {
        let mut h = spawn(|| {
            let lock = Mutex::new(());
            let cv = ConditionVariable::new();
            let mut guard = lock.lock();
            let _ = cv.wait_for(&mut guard, Duration::from_millis(1));
            thread::current_spore().unwrap().is_waiting()
        })
        .unwrap();
        assert!(!h.join().unwrap());
    }
}
