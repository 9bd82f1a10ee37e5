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

use std::cell::UnsafeCell;
use std::ptr;

use crate::coroutine::Coroutine;
use crate::eventloop::EventCore;

/// Nesting limit for `resume` inside `resume`.
pub const MAX_CALL_CHAIN: usize = 128;

thread_local!(static ENVIRONMENT: UnsafeCell<Option<Box<Environment>>> = UnsafeCell::new(None));

/// Coroutine managing environment, one per thread.
///
/// Element 0 of the call chain is the synthetic main coroutine (the thread
/// itself); the top is always the coroutine that is currently running. The
/// two transfer slots carry the shared-stack participants of a switch across
/// the swap boundary, where locals cannot be trusted.
pub struct Environment {
    pub(crate) call_chain: Vec<*mut Coroutine>,
    pub(crate) main_co: *mut Coroutine,
    pub(crate) event_core: Box<EventCore>,

    pub(crate) pending_co: *mut Coroutine,
    pub(crate) occupy_co: *mut Coroutine,
}

impl Environment {
    fn new() -> Box<Environment> {
        let mut env = Box::new(Environment {
            call_chain: Vec::with_capacity(MAX_CALL_CHAIN),
            main_co: ptr::null_mut(),
            event_core: Box::new(EventCore::new().expect("failed to create the event core")),
            pending_co: ptr::null_mut(),
            occupy_co: ptr::null_mut(),
        });

        let main_co = Coroutine::new_main(&mut *env);
        env.main_co = main_co;
        env.call_chain.push(main_co);
        env
    }

    /// The calling thread's environment, created on first use.
    pub fn current() -> &'static mut Environment {
        ENVIRONMENT.with(|env| unsafe {
            let slot = &mut *env.get();
            if slot.is_none() {
                *slot = Some(Environment::new());
            }
            let env: &mut Environment = slot.as_mut().unwrap();
            // the environment lives as long as the thread does
            &mut *(env as *mut Environment)
        })
    }

    /// The currently-running coroutine (the main one when nothing is resumed).
    pub(crate) fn curr_co(&self) -> *mut Coroutine {
        self.call_chain[self.call_chain.len() - 1]
    }

    pub(crate) fn event_core_ptr(&mut self) -> *mut EventCore {
        &mut *self.event_core
    }

    /// Call-chain depth, counting the main coroutine.
    pub fn depth(&self) -> usize {
        self.call_chain.len()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.main_co.is_null() {
            unsafe { Coroutine::free_main(self.main_co) };
            self.main_co = ptr::null_mut();
        }
    }
}
