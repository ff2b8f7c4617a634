// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy shared by every primitive in the crate.
//!
//! Timeouts are not errors: timed operations report them through `bool`,
//! `Option` or [`TryPushError::Full`]. Interruption is the only failure a
//! blocking wait can produce.

use std::backtrace::Backtrace;
use std::fmt;
use std::thread::ThreadId;

use thiserror::Error;

/// Errors surfaced by threads, the executor and construction of primitives.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad construction parameter (zero workers, zero capacity).
    #[error("invalid configuration: {0}")]
    Config(Diagnostic),
    /// Operation on a thread handle that no longer owns a thread.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// A wait was cancelled through [`ThreadHandle::interrupt`](crate::thread::ThreadHandle::interrupt).
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    /// The thread or task body panicked with the given message.
    #[error("panicked: {0}")]
    Panicked(String),
    /// A submitted task was dropped without being run.
    #[error("task was abandoned before it ran")]
    Abandoned,
    /// The executor no longer accepts tasks.
    #[error("executor is shut down")]
    ShutDown,
    /// The operating system refused a request (thread spawn, POSIX semaphore).
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(Diagnostic::new(message))
    }
}

/// Cooperative cancellation delivered at a condition-variable wait boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("thread {thread:?} interrupted")]
pub struct Interrupted {
    thread: ThreadId,
}

impl Interrupted {
    pub(crate) fn current() -> Self {
        Self {
            thread: std::thread::current().id(),
        }
    }

    /// Identity of the thread that observed the interruption.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

/// Message plus the call stack captured where it was raised.
pub struct Diagnostic {
    message: String,
    backtrace: Backtrace,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Captured only when `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE` enable it.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Debug for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostic")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(f, "What:\n{}\nStacktrace:\n{}", self.message, self.backtrace)
        } else {
            f.write_str(&self.message)
        }
    }
}

/// Failed push; the rejected element is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum TryPushError<T> {
    /// No free slot (immediately, or before the deadline).
    Full(T),
    /// The waiting thread was interrupted.
    Interrupted(T, Interrupted),
}

impl<T> TryPushError<T> {
    /// Recover the element that was not pushed.
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(v) | TryPushError::Interrupted(v, _) => v,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TryPushError::Full(_))
    }
}

impl<T> fmt::Display for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPushError::Full(_) => write!(f, "deque is full"),
            TryPushError::Interrupted(_, i) => write!(f, "{}", i),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TryPushError<T> {}

/// Render a panic payload the way `std` prints it.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
