// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Interruption must never be lost, however it races the target's wait.

use std::sync::Arc;
use std::time::Duration;

use interlock::thread::{self, this_thread};
use interlock::{BlockingDeque, ConditionVariable, CountdownLatch, Error, FairSemaphore};
use parking_lot::Mutex;
use proptest::prelude::*;

fn spin_for(micros: u64) {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_micros(micros) {
        std::hint::spin_loop();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn interrupt_reaches_condition_variable_waiter(
        waiter_delay in 0u64..200,
        interrupter_delay in 0u64..200,
    ) {
        let mut handle = thread::spawn(move || {
            spin_for(waiter_delay);
            let lock = Mutex::new(());
            let cv = ConditionVariable::new();
            let mut guard = lock.lock();
            cv.wait_while(&mut guard, |_| true)
        })
        .unwrap();
        spin_for(interrupter_delay);
        handle.interrupt().unwrap();
        prop_assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn interrupt_reaches_blocked_pop(delay in 0u64..200) {
        let deque = Arc::new(BlockingDeque::<u32>::new(4).unwrap());
        let d = Arc::clone(&deque);
        let mut handle = thread::spawn(move || d.pop_front().map(|e| *e)).unwrap();
        spin_for(delay);
        handle.interrupt().unwrap();
        prop_assert!(handle.join().unwrap().is_err());
        prop_assert!(deque.is_empty());
    }

    #[test]
    fn interrupt_reaches_fair_acquire(delay in 0u64..200) {
        let sem = Arc::new(FairSemaphore::new(0));
        let s = Arc::clone(&sem);
        let mut handle = thread::spawn(move || s.acquire()).unwrap();
        spin_for(delay);
        handle.interrupt().unwrap();
        prop_assert!(handle.join().unwrap().is_err());
        prop_assert_eq!(sem.waiters(), 0);
        prop_assert_eq!(sem.available(), 0);
    }
}

#[test]
fn interrupted_thread_can_wait_again() {
    let latch = Arc::new(CountdownLatch::new(1));
    let l = Arc::clone(&latch);
    let mut handle = thread::spawn(move || {
        let first = l.wait();
        // The flag was consumed; this wait ends by the count reaching zero.
        let second = l.wait();
        (first.is_err(), second.is_ok())
    })
    .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    handle.interrupt().unwrap();
    std::thread::sleep(Duration::from_millis(20));
    latch.count_down();
    assert_eq!(handle.join().unwrap(), (true, true));
}

#[test]
fn interrupted_sleep_reports_thread() {
    let mut handle = thread::spawn(|| {
        let id = this_thread::id();
        this_thread::sleep_for(Duration::from_secs(30)).map_err(|i| i.thread() == id)
    })
    .unwrap();
    std::thread::sleep(Duration::from_millis(10));
    handle.interrupt().unwrap();
    assert_eq!(handle.join().unwrap(), Err(true));
}

#[test]
fn interrupt_on_finished_handle_is_harmless() {
    let mut handle = thread::spawn(|| 5).unwrap();
    std::thread::sleep(Duration::from_millis(10));
    handle.interrupt().unwrap();
    assert_eq!(handle.join().unwrap(), 5);
    assert!(matches!(handle.interrupt(), Err(Error::InvalidOperation(_))));
}
