// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The calling core's global interrupt mask, without an [`Arch`](super::Arch) instance.
//!
//! Used by locks that must be usable from `static`s. On the host the mask is emulated per
//! thread so that tests running in parallel do not observe each other.

use super::InterruptState;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        pub fn save_and_disable() -> InterruptState {
            let enabled = cortex_m::register::primask::read().is_active();
            cortex_m::interrupt::disable();
            InterruptState { enabled }
        }

        /// # Safety
        ///
        /// `state` must come from the matching [`save_and_disable`] on this core.
        pub unsafe fn restore(state: InterruptState) {
            if state.enabled {
                // Safety: ensured by caller
                unsafe { cortex_m::interrupt::enable() }
            }
        }

        pub fn are_enabled() -> bool {
            cortex_m::register::primask::read().is_active()
        }
    } else if #[cfg(any(test, feature = "emulate"))] {
        use core::cell::Cell;

        std::thread_local! {
            static MASKED: Cell<bool> = const { Cell::new(false) };
        }

        pub fn save_and_disable() -> InterruptState {
            let enabled = !MASKED.replace(true);
            InterruptState { enabled }
        }

        /// # Safety
        ///
        /// `state` must come from the matching [`save_and_disable`] on this thread.
        pub unsafe fn restore(state: InterruptState) {
            MASKED.set(!state.enabled);
        }

        pub fn are_enabled() -> bool {
            !MASKED.get()
        }
    } else {
        use core::sync::atomic::{AtomicBool, Ordering};

        static MASKED: AtomicBool = AtomicBool::new(false);

        pub fn save_and_disable() -> InterruptState {
            let enabled = !MASKED.swap(true, Ordering::Acquire);
            InterruptState { enabled }
        }

        /// # Safety
        ///
        /// `state` must come from the matching [`save_and_disable`].
        pub unsafe fn restore(state: InterruptState) {
            MASKED.store(!state.enabled, Ordering::Release);
        }

        pub fn are_enabled() -> bool {
            !MASKED.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_save_restore() {
        assert!(are_enabled());

        let outer = save_and_disable();
        assert!(outer.were_enabled());
        assert!(!are_enabled());

        let inner = save_and_disable();
        assert!(!inner.were_enabled());

        unsafe { restore(inner) };
        assert!(!are_enabled());

        unsafe { restore(outer) };
        assert!(are_enabled());
    }
}
