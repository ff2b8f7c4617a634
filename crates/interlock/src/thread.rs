// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Interruptible OS threads.
//!
//! Every thread spawned through [`Builder::spawn`] gets a [`Spore`]: a
//! shared control block holding its interrupted flag and the condition
//! variable it is currently blocked on. Spores live in a process-wide
//! registry keyed by [`ThreadId`] so that [`ConditionVariable`] can find the
//! calling thread's flag without the caller passing it around.
//!
//! Interruption is cooperative. It only takes effect when the target enters
//! or leaves a condition-variable wait; running code is never preempted.
//!
//! [`ConditionVariable`]: crate::condvar::ConditionVariable

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, Thread, ThreadId};

use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::condvar::CondvarInner;
use crate::error::{panic_message, Error};

/// Control block shared by a [`ThreadHandle`] and the registry entry.
#[derive(Debug)]
pub(crate) struct Spore {
    interrupted: AtomicBool,
    /// Condition variable the thread is parked on. Back-reference only.
    waiting_on: Mutex<Option<Weak<CondvarInner>>>,
    thread: Thread,
}

impl Spore {
    fn new(thread: Thread) -> Self {
        Self {
            interrupted: AtomicBool::new(false),
            waiting_on: Mutex::new(None),
            thread,
        }
    }

    /// Publish `cv` as the condition variable this thread is about to wait on.
    pub(crate) fn register(&self, cv: &Arc<CondvarInner>) {
        *self.waiting_on.lock() = Some(Arc::downgrade(cv));
    }

    pub(crate) fn deregister(&self) {
        *self.waiting_on.lock() = None;
    }

    #[cfg(test)]
    pub(crate) fn is_waiting(&self) -> bool {
        self.waiting_on.lock().is_some()
    }

    /// Check-and-clear the interrupted flag.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Raise the flag, then wake the registered condition variable.
    ///
    /// Runs under the spore lock, so the waiter either sees the flag before
    /// parking or is woken after it parked.
    fn interrupt(&self) {
        let waiting_on = self.waiting_on.lock();
        self.interrupted.store(true, Ordering::Release);
        if let Some(cv) = waiting_on.as_ref().and_then(Weak::upgrade) {
            trace!(thread = ?self.thread.id(), "interrupting parked thread");
            cv.notify_all();
        }
    }
}

type Registry = RwLock<HashMap<ThreadId, Arc<Spore>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn register(spore: Arc<Spore>) {
    let id = spore.thread.id();
    let previous = registry().write().insert(id, spore);
    debug_assert!(previous.is_none(), "thread {:?} registered twice", id);
    trace!(thread = ?id, "registered spore");
}

fn unregister(id: ThreadId) {
    if registry().write().remove(&id).is_some() {
        trace!(thread = ?id, "removed spore");
    }
}

/// Spore of the calling thread, if it was spawned through this module.
pub(crate) fn current_spore() -> Option<Arc<Spore>> {
    registry().read().get(&thread::current().id()).cloned()
}

/// Thread factory, mirroring [`std::thread::Builder`].
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Start `f` on a new OS thread.
    ///
    /// The thread's spore is registered before `f` runs, and before this
    /// call returns, so the handle can be interrupted right away.
    pub fn spawn<F, T>(self, f: F) -> Result<ThreadHandle<T>, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let native = builder.spawn(move || {
            let spore = Arc::new(Spore::new(thread::current()));
            register(Arc::clone(&spore));
            let _ = ready_tx.send(spore);
            drop(ready_tx);
            f()
        })?;

        match ready_rx.recv() {
            Ok(spore) => Ok(ThreadHandle {
                inner: Some(Joinable { native, spore }),
            }),
            // The thread died before it could register itself.
            Err(_) => match native.join() {
                Ok(_) => Err(Error::InvalidOperation("thread exited before registering")),
                Err(payload) => Err(Error::Panicked(panic_message(&*payload))),
            },
        }
    }
}

/// Spawn an interruptible thread with default settings.
pub fn spawn<F, T>(f: F) -> Result<ThreadHandle<T>, Error>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f)
}

#[derive(Debug)]
struct Joinable<T> {
    native: JoinHandle<T>,
    spore: Arc<Spore>,
}

/// Owning handle to an interruptible thread.
///
/// A default-constructed, joined or detached handle is empty; `join`,
/// `interrupt` and `native_handle` on an empty handle fail with
/// [`Error::InvalidOperation`].
#[derive(Debug)]
pub struct ThreadHandle<T> {
    inner: Option<Joinable<T>>,
}

impl<T> Default for ThreadHandle<T> {
    fn default() -> Self {
        Self { inner: None }
    }
}

impl<T> ThreadHandle<T> {
    /// Whether the handle still owns a thread.
    pub fn joinable(&self) -> bool {
        self.inner.is_some()
    }

    pub fn id(&self) -> Option<ThreadId> {
        self.inner.as_ref().map(|j| j.spore.thread.id())
    }

    pub fn native_handle(&self) -> Result<&Thread, Error> {
        self.inner
            .as_ref()
            .map(|j| &j.spore.thread)
            .ok_or(Error::InvalidOperation("native_handle on an empty thread handle"))
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(&mut self.inner, &mut other.inner);
    }

    /// Block until the thread finishes and drop its registry entry.
    pub fn join(&mut self) -> Result<T, Error> {
        let Joinable { native, spore } = self
            .inner
            .take()
            .ok_or(Error::InvalidOperation("join on an empty thread handle"))?;
        let id = spore.thread.id();
        let outcome = native.join();
        unregister(id);
        outcome.map_err(|payload| Error::Panicked(panic_message(&*payload)))
    }

    /// Let the thread run on its own. It can no longer be interrupted.
    pub fn detach(&mut self) -> Result<(), Error> {
        let Joinable { native, spore } = self
            .inner
            .take()
            .ok_or(Error::InvalidOperation("detach on an empty thread handle"))?;
        unregister(spore.thread.id());
        drop(native);
        Ok(())
    }

    /// Request cooperative cancellation of the thread.
    ///
    /// The thread observes it as [`Interrupted`](crate::Interrupted) from its
    /// current or next condition-variable wait.
    pub fn interrupt(&self) -> Result<(), Error> {
        let joinable = self
            .inner
            .as_ref()
            .ok_or(Error::InvalidOperation("interrupt on an empty thread handle"))?;
        joinable.spore.interrupt();
        Ok(())
    }
}

impl<T> Drop for ThreadHandle<T> {
    fn drop(&mut self) {
        if let Some(joinable) = self.inner.take() {
            let id = joinable.spore.thread.id();
            warn!(thread = ?id, "thread handle dropped while joinable, detaching");
            unregister(id);
        }
    }
}

/// Operations on the calling thread.
pub mod this_thread {
    use std::thread::ThreadId;
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;

    use crate::condvar::{ConditionVariable, WaitStatus};
    use crate::error::Interrupted;

    pub fn id() -> ThreadId {
        std::thread::current().id()
    }

    pub fn yield_now() {
        std::thread::yield_now();
    }

    /// Whether the calling thread was spawned through [`super::Builder`].
    pub fn is_interruptible() -> bool {
        super::current_spore().is_some()
    }

    /// Sleep for `duration`, waking early with `Err` if interrupted.
    pub fn sleep_for(duration: Duration) -> Result<(), Interrupted> {
        match Instant::now().checked_add(duration) {
            Some(deadline) => sleep_until(deadline),
            None => {
                let lock = Mutex::new(());
                let cv = ConditionVariable::new();
                let mut guard = lock.lock();
                loop {
                    cv.wait(&mut guard)?;
                }
            }
        }
    }

    /// Sleep until `deadline`, waking early with `Err` if interrupted.
    pub fn sleep_until(deadline: Instant) -> Result<(), Interrupted> {
        if !is_interruptible() {
            std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
            return Ok(());
        }
        let lock = Mutex::new(());
        let cv = ConditionVariable::new();
        let mut guard = lock.lock();
        while cv.wait_until(&mut guard, deadline)? == WaitStatus::Notified {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn spawn_and_join() {
        let mut h = spawn(|| 42).unwrap();
        assert!(h.joinable());
        assert_eq!(h.join().unwrap(), 42);
        assert!(!h.joinable());
    }

    #[test]
    fn join_empty_handle_is_invalid() {
        let mut h: ThreadHandle<()> = ThreadHandle::default();
        assert!(matches!(h.join(), Err(Error::InvalidOperation(_))));
        assert!(matches!(h.interrupt(), Err(Error::InvalidOperation(_))));
        assert!(matches!(h.native_handle(), Err(Error::InvalidOperation(_))));
        assert!(h.id().is_none());
    }

    #[test]
    fn join_twice_is_invalid() {
        let mut h = spawn(|| ()).unwrap();
        h.join().unwrap();
        assert!(matches!(h.join(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn panic_is_reported_on_join() {
        let mut h = spawn(|| -> i32 { panic!("boom") }).unwrap();
        match h.join() {
            Err(Error::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn registry_tracks_lifecycle() {
        let (tx, rx) = mpsc::channel();
        let mut h = spawn(move || {
            tx.send(this_thread::is_interruptible()).unwrap();
        })
        .unwrap();
        let id = h.id().unwrap();
        assert!(registry().read().contains_key(&id));
        h.join().unwrap();
        assert!(rx.recv().unwrap());
        assert!(!registry().read().contains_key(&id));
    }

    #[test]
    fn detach_removes_registry_entry() {
        let mut h = spawn(|| std::thread::sleep(Duration::from_millis(10))).unwrap();
        let id = h.id().unwrap();
        h.detach().unwrap();
        assert!(!h.joinable());
        assert!(!registry().read().contains_key(&id));
        assert!(matches!(h.interrupt(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn builder_names_thread() {
        let mut h = Builder::new()
            .name("interlock-test")
            .spawn(|| std::thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(h.native_handle().unwrap().name(), Some("interlock-test"));
        assert_eq!(h.join().unwrap().as_deref(), Some("interlock-test"));
    }

    #[test]
    fn swap_exchanges_ownership() {
        let mut a = spawn(|| 1).unwrap();
        let mut b = ThreadHandle::default();
        a.swap(&mut b);
        assert!(!a.joinable());
        assert_eq!(b.join().unwrap(), 1);
    }

    #[test]
    fn main_thread_is_not_interruptible() {
        assert!(!this_thread::is_interruptible());
        this_thread::sleep_for(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn interrupt_wakes_sleeper() {
        let mut h = spawn(|| this_thread::sleep_for(Duration::from_secs(30))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        h.interrupt().unwrap();
        assert!(h.join().unwrap().is_err());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn interrupt_before_sleep_is_not_lost() {
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let mut h = spawn(move || {
            go_rx.recv().unwrap();
            this_thread::sleep_for(Duration::from_secs(30))
        })
        .unwrap();
        h.interrupt().unwrap();
        go_tx.send(()).unwrap();
        assert!(h.join().unwrap().is_err());
    }

    #[test]
    fn uninterrupted_sleep_completes() {
        let mut h = spawn(|| {
            let start = Instant::now();
            this_thread::sleep_for(Duration::from_millis(10)).map(|()| start.elapsed())
        })
        .unwrap();
        assert!(h.join().unwrap().unwrap() >= Duration::from_millis(10));
    }
}
