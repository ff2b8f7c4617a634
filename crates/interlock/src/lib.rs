// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Interruptible threading primitives.
//!
//! Threads spawned through [`thread`] can be interrupted: their current or
//! next wait on a [`ConditionVariable`] fails with [`Interrupted`]. Everything
//! else here is built on that condition variable, so blocking operations on
//! semaphores, deques and latches are interruptible too.
//!
//! Components:
//! - thread: spawn/join/detach/interrupt, `this_thread` helpers
//! - condvar: condition variable with interruptible waits
//! - semaphore: unfair, FIFO-fair and POSIX counting semaphores
//! - deque: bounded blocking deque of shared elements
//! - executor: fixed thread pool with graceful and forced shutdown
//! - latch: countdown latch

pub mod alloc;
pub mod condvar;
pub mod deque;
pub mod error;
pub mod executor;
pub mod latch;
pub mod semaphore;
pub mod thread;

pub use alloc::{Allocator, DefaultAllocator};
pub use condvar::{ConditionVariable, WaitStatus};
pub use deque::{BasicBlockingDeque, BlockingDeque, FairBlockingDeque};
pub use error::{Diagnostic, Error, Interrupted, TryPushError};
pub use executor::{Executor, ExecutorConfig, Pending};
pub use latch::CountdownLatch;
pub use semaphore::{CountingSemaphore, FairSemaphore, Semaphore};
pub use thread::{Builder, ThreadHandle};

#[cfg(target_os = "linux")]
pub use semaphore::PosixSemaphore;

/// Semaphore meant to hold zero or one unit.
pub type BinarySemaphore = Semaphore;
/// FIFO semaphore meant to hold zero or one unit.
pub type FairBinarySemaphore = FairSemaphore;
