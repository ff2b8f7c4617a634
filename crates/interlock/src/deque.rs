// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded blocking double-ended queue.
//!
//! Two semaphores track the deque: `slots` counts free capacity and `items`
//! counts linked elements. Every push takes a slot permit, links the element
//! under the storage mutex, then releases an item permit; pops do the
//! reverse. Waiting happens on the semaphores, never while holding the
//! storage mutex, so the mutex is held only around the splice.
//!
//! Elements are stored as `Arc<E>`: the deque drops its share on pop and the
//! caller's handle decides the payload's lifetime.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::alloc::{Allocator, DefaultAllocator};
use crate::error::{Error, Interrupted, TryPushError};
use crate::semaphore::{CountingSemaphore, FairSemaphore, Semaphore};

/// Deque on the unfair [`Semaphore`]; no ordering among blocked callers.
pub type BlockingDeque<E> = BasicBlockingDeque<E, Semaphore>;

/// Deque on the [`FairSemaphore`]; blocked pushers and poppers are served
/// in arrival order.
pub type FairBlockingDeque<E> = BasicBlockingDeque<E, FairSemaphore>;

#[derive(Debug, Clone, Copy)]
enum End {
    Front,
    Back,
}

#[derive(Debug, Clone, Copy)]
enum Wait {
    Block,
    Try,
    Until(Instant),
}

impl Wait {
    fn after(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Wait::Until(deadline),
            None => Wait::Block,
        }
    }

    /// `Ok(false)` when the permit could not be had in time.
    fn acquire<S: CountingSemaphore>(self, sem: &S) -> Result<bool, Interrupted> {
        match self {
            Wait::Block => sem.acquire().map(|()| true),
            Wait::Try => Ok(sem.try_acquire()),
            Wait::Until(deadline) => sem.try_acquire_until(deadline),
        }
    }
}

/// Held slot permit; given back on drop unless the element got linked.
struct Permit<'a, S: CountingSemaphore> {
    sem: &'a S,
    armed: bool,
}

impl<'a, S: CountingSemaphore> Permit<'a, S> {
    fn new(sem: &'a S) -> Self {
        Self { sem, armed: true }
    }

    fn consume(mut self) {
        self.armed = false;
    }
}

impl<S: CountingSemaphore> Drop for Permit<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.sem.release(1);
        }
    }
}

/// Blocking deque of `Arc<E>` with capacity enforced by semaphore `S`.
///
/// Push operations block while the deque is full, pops and peeks while it
/// is empty. `try_*` forms never block; `*_for`/`*_until` forms give up at
/// a deadline. Every blocking form fails with [`Interrupted`] when the
/// calling interruptible thread is interrupted.
pub struct BasicBlockingDeque<E, S = Semaphore, A = DefaultAllocator>
where
    S: CountingSemaphore,
    A: Allocator,
{
    alloc: A,
    slots: S,
    items: S,
    storage: Mutex<VecDeque<Arc<E>>>,
    capacity: usize,
}

impl<E, S: CountingSemaphore> BasicBlockingDeque<E, S, DefaultAllocator> {
    /// Deque holding at most `max_capacity` elements.
    pub fn new(max_capacity: usize) -> Result<Self, Error> {
        Self::with_allocator(DefaultAllocator, max_capacity)
    }

    /// Deque bounded only by [`Self::MAX`].
    pub fn unbounded() -> Self {
        Self::build(DefaultAllocator, Self::MAX)
    }
}

impl<E, S, A> BasicBlockingDeque<E, S, A>
where
    S: CountingSemaphore,
    A: Allocator,
{
    /// Largest capacity the slot semaphore can count.
    pub const MAX: usize = S::MAX;

    pub fn with_allocator(alloc: A, max_capacity: usize) -> Result<Self, Error> {
        if max_capacity == 0 {
            return Err(Error::config("max_capacity == 0"));
        }
        Ok(Self::build(alloc, max_capacity))
    }

    fn build(alloc: A, capacity: usize) -> Self {
        debug!(capacity, "creating blocking deque");
        Self {
            alloc,
            slots: S::new(capacity),
            items: S::new(0),
            storage: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.storage.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }

    // Push.

    pub fn push_back(&self, element: Arc<E>) -> Result<(), Interrupted> {
        self.push_blocking(End::Back, element, link_shared).map(drop)
    }

    pub fn push_front(&self, element: Arc<E>) -> Result<(), Interrupted> {
        self.push_blocking(End::Front, element, link_shared).map(drop)
    }

    pub fn try_push_back(&self, element: Arc<E>) -> Result<(), TryPushError<Arc<E>>> {
        self.push(End::Back, Wait::Try, element, link_shared).map(drop)
    }

    pub fn try_push_front(&self, element: Arc<E>) -> Result<(), TryPushError<Arc<E>>> {
        self.push(End::Front, Wait::Try, element, link_shared).map(drop)
    }

    pub fn try_push_back_for(
        &self,
        element: Arc<E>,
        timeout: Duration,
    ) -> Result<(), TryPushError<Arc<E>>> {
        self.push(End::Back, Wait::after(timeout), element, link_shared).map(drop)
    }

    pub fn try_push_front_for(
        &self,
        element: Arc<E>,
        timeout: Duration,
    ) -> Result<(), TryPushError<Arc<E>>> {
        self.push(End::Front, Wait::after(timeout), element, link_shared).map(drop)
    }

    pub fn try_push_back_until(
        &self,
        element: Arc<E>,
        deadline: Instant,
    ) -> Result<(), TryPushError<Arc<E>>> {
        self.push(End::Back, Wait::Until(deadline), element, link_shared).map(drop)
    }

    pub fn try_push_front_until(
        &self,
        element: Arc<E>,
        deadline: Instant,
    ) -> Result<(), TryPushError<Arc<E>>> {
        self.push(End::Front, Wait::Until(deadline), element, link_shared).map(drop)
    }

    // Emplace: the element is built through the allocator once a slot is held.

    pub fn emplace_back(&self, value: E) -> Result<Arc<E>, Interrupted> {
        self.push_blocking(End::Back, value, wrap_value)
    }

    pub fn emplace_front(&self, value: E) -> Result<Arc<E>, Interrupted> {
        self.push_blocking(End::Front, value, wrap_value)
    }

    /// Like [`emplace_back`](Self::emplace_back), running `make` only after
    /// a slot is free. If `make` panics the slot is given back.
    pub fn emplace_back_with<F>(&self, make: F) -> Result<Arc<E>, Interrupted>
    where
        F: FnOnce() -> E,
    {
        self.push_blocking(End::Back, make, |alloc, make| alloc.make_shared_with(make))
    }

    pub fn emplace_front_with<F>(&self, make: F) -> Result<Arc<E>, Interrupted>
    where
        F: FnOnce() -> E,
    {
        self.push_blocking(End::Front, make, |alloc, make| alloc.make_shared_with(make))
    }

    pub fn try_emplace_back(&self, value: E) -> Result<Arc<E>, TryPushError<E>> {
        self.push(End::Back, Wait::Try, value, wrap_value)
    }

    pub fn try_emplace_front(&self, value: E) -> Result<Arc<E>, TryPushError<E>> {
        self.push(End::Front, Wait::Try, value, wrap_value)
    }

    pub fn try_emplace_back_for(
        &self,
        value: E,
        timeout: Duration,
    ) -> Result<Arc<E>, TryPushError<E>> {
        self.push(End::Back, Wait::after(timeout), value, wrap_value)
    }

    pub fn try_emplace_front_for(
        &self,
        value: E,
        timeout: Duration,
    ) -> Result<Arc<E>, TryPushError<E>> {
        self.push(End::Front, Wait::after(timeout), value, wrap_value)
    }

    pub fn try_emplace_back_until(
        &self,
        value: E,
        deadline: Instant,
    ) -> Result<Arc<E>, TryPushError<E>> {
        self.push(End::Back, Wait::Until(deadline), value, wrap_value)
    }

    pub fn try_emplace_front_until(
        &self,
        value: E,
        deadline: Instant,
    ) -> Result<Arc<E>, TryPushError<E>> {
        self.push(End::Front, Wait::Until(deadline), value, wrap_value)
    }

    // Peek.

    pub fn front(&self) -> Result<Arc<E>, Interrupted> {
        self.blocking(|| self.peek(End::Front, Wait::Block))
    }

    pub fn back(&self) -> Result<Arc<E>, Interrupted> {
        self.blocking(|| self.peek(End::Back, Wait::Block))
    }

    pub fn try_front(&self) -> Option<Arc<E>> {
        self.peek(End::Front, Wait::Try).ok().flatten()
    }

    pub fn try_back(&self) -> Option<Arc<E>> {
        self.peek(End::Back, Wait::Try).ok().flatten()
    }

    pub fn try_front_for(&self, timeout: Duration) -> Result<Option<Arc<E>>, Interrupted> {
        self.peek(End::Front, Wait::after(timeout))
    }

    pub fn try_back_for(&self, timeout: Duration) -> Result<Option<Arc<E>>, Interrupted> {
        self.peek(End::Back, Wait::after(timeout))
    }

    pub fn try_front_until(&self, deadline: Instant) -> Result<Option<Arc<E>>, Interrupted> {
        self.peek(End::Front, Wait::Until(deadline))
    }

    pub fn try_back_until(&self, deadline: Instant) -> Result<Option<Arc<E>>, Interrupted> {
        self.peek(End::Back, Wait::Until(deadline))
    }

    // Pop.

    pub fn pop_front(&self) -> Result<Arc<E>, Interrupted> {
        self.blocking(|| self.pop(End::Front, Wait::Block))
    }

    pub fn pop_back(&self) -> Result<Arc<E>, Interrupted> {
        self.blocking(|| self.pop(End::Back, Wait::Block))
    }

    pub fn try_pop_front(&self) -> Option<Arc<E>> {
        self.pop(End::Front, Wait::Try).ok().flatten()
    }

    pub fn try_pop_back(&self) -> Option<Arc<E>> {
        self.pop(End::Back, Wait::Try).ok().flatten()
    }

    pub fn try_pop_front_for(&self, timeout: Duration) -> Result<Option<Arc<E>>, Interrupted> {
        self.pop(End::Front, Wait::after(timeout))
    }

    pub fn try_pop_back_for(&self, timeout: Duration) -> Result<Option<Arc<E>>, Interrupted> {
        self.pop(End::Back, Wait::after(timeout))
    }

    pub fn try_pop_front_until(&self, deadline: Instant) -> Result<Option<Arc<E>>, Interrupted> {
        self.pop(End::Front, Wait::Until(deadline))
    }

    pub fn try_pop_back_until(&self, deadline: Instant) -> Result<Option<Arc<E>>, Interrupted> {
        self.pop(End::Back, Wait::Until(deadline))
    }

    // Protocol.

    /// Take a slot, build the element, link it, publish an item.
    fn push<T>(
        &self,
        end: End,
        wait: Wait,
        input: T,
        make: fn(&A, T) -> Arc<E>,
    ) -> Result<Arc<E>, TryPushError<T>> {
        match wait.acquire(&self.slots) {
            Ok(true) => {}
            Ok(false) => return Err(TryPushError::Full(input)),
            Err(interrupted) => return Err(TryPushError::Interrupted(input, interrupted)),
        }
        let permit = Permit::new(&self.slots);
        let element = make(&self.alloc, input);
        self.link(end, Arc::clone(&element));
        permit.consume();
        self.items.release(1);
        Ok(element)
    }

    fn push_blocking<T>(
        &self,
        end: End,
        mut input: T,
        make: fn(&A, T) -> Arc<E>,
    ) -> Result<Arc<E>, Interrupted> {
        loop {
            match self.push(end, Wait::Block, input, make) {
                Ok(element) => return Ok(element),
                Err(TryPushError::Interrupted(_, interrupted)) => return Err(interrupted),
                // A blocking acquire only returns after taking a permit.
                Err(TryPushError::Full(back)) => input = back,
            }
        }
    }

    fn link(&self, end: End, element: Arc<E>) {
        let mut storage = self.storage.lock();
        match end {
            End::Front => storage.push_front(element),
            End::Back => storage.push_back(element),
        }
    }

    fn pop(&self, end: End, wait: Wait) -> Result<Option<Arc<E>>, Interrupted> {
        if !wait.acquire(&self.items)? {
            return Ok(None);
        }
        let element = {
            let mut storage = self.storage.lock();
            match end {
                End::Front => storage.pop_front(),
                End::Back => storage.pop_back(),
            }
        };
        match element {
            Some(element) => {
                self.slots.release(1);
                Ok(Some(element))
            }
            None => {
                // Nothing to unlink; the item permit goes back untouched.
                self.items.release(1);
                Ok(None)
            }
        }
    }

    /// Read an end without consuming: the item permit is returned at once.
    fn peek(&self, end: End, wait: Wait) -> Result<Option<Arc<E>>, Interrupted> {
        if !wait.acquire(&self.items)? {
            return Ok(None);
        }
        let element = {
            let storage = self.storage.lock();
            match end {
                End::Front => storage.front().cloned(),
                End::Back => storage.back().cloned(),
            }
        };
        self.items.release(1);
        Ok(element)
    }

    fn blocking<F>(&self, mut attempt: F) -> Result<Arc<E>, Interrupted>
    where
        F: FnMut() -> Result<Option<Arc<E>>, Interrupted>,
    {
        loop {
            if let Some(element) = attempt()? {
                return Ok(element);
            }
        }
    }
}

fn link_shared<A, E>(_: &A, element: Arc<E>) -> Arc<E> {
    element
}

fn wrap_value<A: Allocator, E>(alloc: &A, value: E) -> Arc<E> {
    alloc.make_shared(value)
}

impl<E, S, A> fmt::Debug for BasicBlockingDeque<E, S, A>
where
    S: CountingSemaphore,
    A: Allocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicBlockingDeque")
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
