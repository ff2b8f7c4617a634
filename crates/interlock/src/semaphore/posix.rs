// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Unnamed POSIX semaphore (`sem_t`).
//!
//! Not interruptible: `sem_wait` knows nothing about spores. Useful where a
//! kernel-backed counter is wanted, e.g. signalling from a signal handler.

use std::cell::UnsafeCell;
use std::io;

use crate::error::Error;

pub struct PosixSemaphore {
    // Boxed so the sem_t never moves after sem_init.
    sem: Box<UnsafeCell<libc::sem_t>>,
}

// SAFETY: sem_t is designed for concurrent use through the sem_* calls,
// which are the only way the cell is accessed.
unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl PosixSemaphore {
    pub fn new(initial: u32) -> Result<Self, Error> {
        // SAFETY: sem_t is plain data; sem_init overwrites it before use.
        let sem = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed::<libc::sem_t>() }));
        // SAFETY: the pointer is valid and unshared (pshared = 0).
        if unsafe { libc::sem_init(sem.get(), 0, initial) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { sem })
    }

    pub fn release(&self) -> Result<(), Error> {
        // SAFETY: initialized in new, destroyed only in drop.
        if unsafe { libc::sem_post(self.sem.get()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn acquire(&self) -> Result<(), Error> {
        loop {
            // SAFETY: see release.
            if unsafe { libc::sem_wait(self.sem.get()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        // SAFETY: see release.
        unsafe { libc::sem_trywait(self.sem.get()) == 0 }
    }

    pub fn value(&self) -> Result<usize, Error> {
        let mut value: libc::c_int = 0;
        // SAFETY: see release; value is a valid out pointer.
        if unsafe { libc::sem_getvalue(self.sem.get(), &mut value) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Linux reports 0, never a negative waiter count.
        Ok(usize::try_from(value).unwrap_or(0))
    }
}

impl Drop for PosixSemaphore {
    fn drop(&mut self) {
        // SAFETY: no other reference exists once we are dropped.
        unsafe {
            libc::sem_destroy(self.sem.get());
        }
    }
}

impl std::fmt::Debug for PosixSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PosixSemaphore")
            .field("value", &self.value().ok())
            .finish()
    }
}
