// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Counting semaphores.
//!
//! - [`Semaphore`]: condition-variable based, no ordering among waiters.
//! - [`FairSemaphore`]: explicit FIFO of waiters, strict arrival-order grants.
//! - [`PosixSemaphore`]: thin wrapper over `sem_t` (Linux only).
//!
//! The first two implement [`CountingSemaphore`], which is what
//! [`BasicBlockingDeque`](crate::deque::BasicBlockingDeque) is generic over.
//! Their blocking acquires fail with [`Interrupted`] when the calling
//! interruptible thread is interrupted.

use std::time::{Duration, Instant};

use crate::error::Interrupted;

mod counting;
mod fair;
#[cfg(target_os = "linux")]
mod posix;

pub use counting::Semaphore;
pub use fair::FairSemaphore;
#[cfg(target_os = "linux")]
pub use posix::PosixSemaphore;

/// Interface shared by the semaphores a blocking deque can be built on.
pub trait CountingSemaphore: Send + Sync {
    /// Largest count the semaphore can represent.
    const MAX: usize = usize::MAX;

    fn new(desired: usize) -> Self
    where
        Self: Sized;

    /// Take one unit, blocking until one is available.
    fn acquire(&self) -> Result<(), Interrupted>;

    /// Take one unit if one is available right now.
    fn try_acquire(&self) -> bool;

    /// Take one unit, giving up at `deadline`. `Ok(false)` means timeout.
    fn try_acquire_until(&self, deadline: Instant) -> Result<bool, Interrupted>;

    fn try_acquire_for(&self, timeout: Duration) -> Result<bool, Interrupted> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.try_acquire_until(deadline),
            None => self.acquire().map(|()| true),
        }
    }

    /// Return `update` units, waking up to `update` waiters.
    fn release(&self, update: usize);

    /// Units not currently held.
    fn available(&self) -> usize;
}
