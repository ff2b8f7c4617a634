// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Element allocation for blocking deques.
//!
//! The deque builds the shared handle it stores and returns through an
//! [`Allocator`]. Element type is chosen per call, so one allocator serves
//! the element and any related type the caller shares it with.

use std::sync::Arc;

/// Builds reference-counted elements.
///
/// A constructor that panics must leave nothing allocated behind; building
/// the value before wrapping it, as [`DefaultAllocator`] does, gives that.
pub trait Allocator: Send + Sync {
    fn make_shared<E>(&self, value: E) -> Arc<E>;

    fn make_shared_with<E, F>(&self, make: F) -> Arc<E>
    where
        F: FnOnce() -> E,
    {
        self.make_shared(make())
    }
}

/// Global heap allocation through [`Arc::new`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultAllocator;

impl Allocator for DefaultAllocator {
    fn make_shared<E>(&self, value: E) -> Arc<E> {
        Arc::new(value)
    }
}
