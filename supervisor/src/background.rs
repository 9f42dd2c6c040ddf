// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deferred work queued from interrupt context and drained by mainline code.

use core::fmt;
use core::ptr;

use arrayvec::ArrayVec;

use crate::kconfig::BACKGROUND_QUEUE_CAPACITY;
use crate::sync::CriticalSection;
use crate::{Error, Result};

#[derive(Copy, Clone)]
pub struct BackgroundCallback {
    func: fn(usize),
    data: usize,
}

impl fmt::Debug for BackgroundCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundCallback")
            .field("func", &(self.func as *const ()))
            .field("data", &self.data)
            .finish()
    }
}

impl BackgroundCallback {
    pub const fn new(func: fn(usize), data: usize) -> Self {
        Self { func, data }
    }

    fn is_same(&self, other: &Self) -> bool {
        ptr::fn_addr_eq(self.func, other.func) && self.data == other.data
    }

    fn run(self) {
        (self.func)(self.data);
    }
}

/// A FIFO of pending callbacks.
///
/// The queue lock is held only while a callback is pushed or popped, never while one runs,
/// so callbacks are free to queue more work.
pub struct BackgroundQueue {
    queue: CriticalSection<ArrayVec<BackgroundCallback, BACKGROUND_QUEUE_CAPACITY>>,
}

impl Default for BackgroundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BackgroundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundQueue")
            .field("queue", &*self.queue.lock())
            .finish()
    }
}

impl BackgroundQueue {
    pub const fn new() -> Self {
        Self {
            queue: CriticalSection::const_new(
                <crate::sync::RawCriticalSection as lock_api::RawMutex>::INIT,
                ArrayVec::new_const(),
            ),
        }
    }

    /// Queues `callback` unless an identical callback is already pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if every slot is taken.
    pub fn add(&self, callback: BackgroundCallback) -> Result<()> {
        let mut queue = self.queue.lock();

        if queue.iter().any(|queued| queued.is_same(&callback)) {
            return Ok(());
        }

        queue.try_push(callback).map_err(|_| Error::QueueFull)
    }

    pub fn pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Runs the callbacks that are queued when the call starts, in order.
    ///
    /// Callbacks queued while the pass runs are left for the next pass.
    pub fn run_all(&self) {
        let count = self.queue.lock().len();

        for _ in 0..count {
            let next = {
                let mut queue = self.queue.lock();
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            };

            match next {
                Some(callback) => callback.run(),
                None => break,
            }
        }
    }

    /// Drops every pending callback.
    pub fn reset(&self) {
        self.queue.lock().clear();
    }
}
