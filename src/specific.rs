// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Coroutine-local storage.
//!
//! A small-integer-keyed pointer slot table. Lookups are two-tier: code
//! running on the main coroutine (or outside any coroutine) reads the
//! thread's own table, everything else reads the current coroutine's table.

use std::cell::UnsafeCell;
use std::os::raw::c_void;
use std::ptr;

use crate::environment::Environment;

/// Slots per coroutine (and per thread for the main tier).
pub const SPEC_SLOTS: usize = 1024;

thread_local!(static THREAD_SPEC: UnsafeCell<Vec<*mut c_void>> =
    UnsafeCell::new(vec![ptr::null_mut(); SPEC_SLOTS]));

pub fn get_specific(key: usize) -> *mut c_void {
    if key >= SPEC_SLOTS {
        return ptr::null_mut();
    }
    let co = Environment::current().curr_co();
    unsafe {
        if (*co).is_main {
            THREAD_SPEC.with(|s| (&*s.get())[key])
        } else {
            (*co).spec[key]
        }
    }
}

/// Returns false when the key is out of range.
pub fn set_specific(key: usize, value: *mut c_void) -> bool {
    if key >= SPEC_SLOTS {
        return false;
    }
    let co = Environment::current().curr_co();
    unsafe {
        if (*co).is_main {
            THREAD_SPEC.with(|s| (&mut *s.get())[key] = value);
        } else {
            (*co).spec[key] = value;
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coroutine::Coroutine;

    #[test]
    fn test_slots_are_per_coroutine() {
        assert!(set_specific(3, 0x11 as *mut c_void));

        let coro = Coroutine::spawn(|| {
            // the coroutine's own table starts empty
            assert!(get_specific(3).is_null());
            assert!(set_specific(3, 0x22 as *mut c_void));
            Coroutine::sched();
            assert_eq!(get_specific(3), 0x22 as *mut c_void);
        });

        coro.resume().ok().expect("failed to resume");
        // the main tier is untouched by the coroutine's writes
        assert_eq!(get_specific(3), 0x11 as *mut c_void);
        coro.resume().ok().expect("failed to resume");
        coro.release();

        assert!(!set_specific(SPEC_SLOTS, ptr::null_mut()));
    }
}
