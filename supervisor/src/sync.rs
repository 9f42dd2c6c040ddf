// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{InterruptState, interrupt};

pub type CriticalSection<T> = lock_api::Mutex<RawCriticalSection, T>;

/// A lock that is safe to share between interrupt handlers, mainline code and the other core.
///
/// Locking masks interrupts on the calling core first and then spins on a flag for the other
/// core. Unlocking releases the flag and restores the exact interrupt state from before the
/// lock was taken. Guards must therefore never be held across blocking work.
pub struct RawCriticalSection {
    lock: AtomicBool,
    /// Interrupt state of the current holder, only touched while `lock` is held.
    saved: AtomicBool,
}

// Safety: `lock` hands out exclusive access through an acquire CAS and `unlock` releases it
unsafe impl lock_api::RawMutex for RawCriticalSection {
    // the saved interrupt state belongs to the locking core
    type GuardMarker = lock_api::GuardNoSend;

    const INIT: Self = Self {
        lock: AtomicBool::new(false),
        saved: AtomicBool::new(false),
    };

    fn lock(&self) {
        let state = interrupt::save_and_disable();

        let mut boff = Backoff::new();
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.spin();
            }
        }

        self.saved.store(state.were_enabled(), Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        let state = interrupt::save_and_disable();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.saved.store(state.were_enabled(), Ordering::Relaxed);
            true
        } else {
            // Safety: restores the state saved above
            unsafe { interrupt::restore(state) };
            false
        }
    }

    unsafe fn unlock(&self) {
        let state = InterruptState {
            enabled: self.saved.load(Ordering::Relaxed),
        };
        self.lock.store(false, Ordering::Release);
        // Safety: the state was saved by the `lock` call this unlock pairs with
        unsafe { interrupt::restore(state) };
    }

    fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

/// Exponential backoff for spin loops, capped at `2^MAX_EXPONENT` spins per round.
#[derive(Debug, Copy, Clone)]
struct Backoff {
    exp: u8,
}

impl Backoff {
    const MAX_EXPONENT: u8 = 6;

    const fn new() -> Self {
        Self { exp: 0 }
    }

    #[inline]
    fn spin(&mut self) {
        for _ in 0..1_u32 << self.exp {
            #[cfg(test)]
            std::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < Self::MAX_EXPONENT {
            self.exp += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn masks_interrupts_while_held() {
        let cs = CriticalSection::new(0);
        assert!(interrupt::are_enabled());

        {
            let mut guard = cs.lock();
            *guard += 1;
            assert!(!interrupt::are_enabled());
        }

        assert!(interrupt::are_enabled());
        assert_eq!(*cs.lock(), 1);
    }

    #[test]
    fn preserves_outer_mask() {
        let cs = CriticalSection::new(());

        let outer = interrupt::save_and_disable();
        drop(cs.lock());
        // still masked, the lock must not re-enable interrupts it did not disable
        assert!(!interrupt::are_enabled());
        unsafe { interrupt::restore(outer) };

        assert!(interrupt::are_enabled());
    }

    #[test]
    fn failed_try_lock_restores_mask() {
        let cs = CriticalSection::new(());
        let guard = cs.lock();

        let res = thread::scope(|s| {
            s.spawn(|| {
                let locked = cs.try_lock().is_some();
                (locked, interrupt::are_enabled())
            })
            .join()
            .unwrap()
        });
        assert_eq!(res, (false, true));

        drop(guard);
    }

    #[test]
    fn excludes_other_threads() {
        let cs = Arc::new(CriticalSection::new(0usize));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cs = cs.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *cs.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*cs.lock(), 4000);
    }
}
