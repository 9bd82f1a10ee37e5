// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

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

//! Coroutine lifecycle and cooperative switching.
//!
//! A coroutine is an entry closure plus a register context and a stack
//! frame. `resume` pushes it onto the thread's call chain and switches in;
//! `sched` pops the chain and switches back to whoever resumed. A coroutine
//! whose entry returns is finished and can only be released or reset.
//!
//! In shared-stack mode the switch additionally evicts the frame's previous
//! occupant (saving its live bytes) and restores the incoming coroutine's
//! saved bytes once control is on the new stack.

use std::alloc::{alloc, dealloc, Layout};
use std::any::Any;
use std::fmt;
use std::os::raw::c_void;
use std::panic;
use std::ptr;
use std::rc::Rc;

use log::{error, warn};

use crate::context::Context;
use crate::environment::{Environment, MAX_CALL_CHAIN};
use crate::options::Options;
use crate::specific::SPEC_SLOTS;
use crate::stack::{normalize_stack_size, ShareStack, StackMem};
use crate::{Error, ResumeResult};

pub struct Coroutine {
    pub(crate) env: *mut Environment,
    name: Option<String>,
    entry: Option<Box<dyn FnMut()>>,

    pub(crate) ctx: Context,

    pub(crate) started: bool,
    pub(crate) finished: bool,
    pub(crate) is_main: bool,
    pub(crate) sys_hook: bool,
    pub(crate) is_share_stack: bool,

    pub(crate) stack_mem: *mut StackMem,
    // keeps the pool alive for as long as any coroutine uses it
    share_stack: Option<Rc<ShareStack>>,

    /// Stack pointer at the moment this coroutine was last switched away.
    pub(crate) stack_sp: *mut u8,
    pub(crate) save_buffer: *mut u8,
    pub(crate) save_size: usize,

    panic_payload: Option<Box<dyn Any + Send>>,

    /// Coroutine-local slot table.
    pub(crate) spec: Box<[*mut c_void]>,
    /// Opaque per-coroutine slot for external collaborators.
    collab_data: *mut c_void,
}

impl Coroutine {
    /// Spawn with default options (128 KiB independent stack).
    pub fn spawn<F>(f: F) -> Handle
    where
        F: FnMut() + 'static,
    {
        Coroutine::spawn_opts(f, Default::default())
    }

    pub fn spawn_opts<F>(f: F, opts: Options) -> Handle
    where
        F: FnMut() + 'static,
    {
        let env = Environment::current();

        let (stack_mem, stack_size) = match &opts.share_stack {
            Some(pool) => (pool.get_mem(), pool.stack_size()),
            None => {
                let size = normalize_stack_size(opts.stack_size);
                (StackMem::alloc(size), size)
            }
        };

        let mut co = Box::new(Coroutine {
            env: env as *mut Environment,
            name: opts.name,
            entry: Some(Box::new(f)),
            ctx: Context::empty(),
            started: false,
            finished: false,
            is_main: false,
            sys_hook: false,
            is_share_stack: opts.share_stack.is_some(),
            stack_mem,
            share_stack: opts.share_stack,
            stack_sp: ptr::null_mut(),
            save_buffer: ptr::null_mut(),
            save_size: 0,
            panic_payload: None,
            spec: vec![ptr::null_mut(); SPEC_SLOTS].into_boxed_slice(),
            collab_data: ptr::null_mut(),
        });
        unsafe {
            co.ctx.set_stack((*stack_mem).buffer, stack_size);
        }
        Handle(Box::into_raw(co))
    }

    /// The synthetic coroutine standing for the thread itself; it runs on
    /// the thread's own stack and owns no frame.
    pub(crate) fn new_main(env: *mut Environment) -> *mut Coroutine {
        Box::into_raw(Box::new(Coroutine {
            env,
            name: Some("<main>".to_string()),
            entry: None,
            ctx: Context::empty(),
            started: true,
            finished: false,
            is_main: true,
            sys_hook: false,
            is_share_stack: false,
            stack_mem: ptr::null_mut(),
            share_stack: None,
            stack_sp: ptr::null_mut(),
            save_buffer: ptr::null_mut(),
            save_size: 0,
            panic_payload: None,
            spec: vec![ptr::null_mut(); SPEC_SLOTS].into_boxed_slice(),
            collab_data: ptr::null_mut(),
        }))
    }

    pub(crate) unsafe fn free_main(co: *mut Coroutine) {
        drop(Box::from_raw(co));
    }

    /// Yield the current coroutine back to whoever resumed it.
    pub fn sched() {
        unsafe { yield_env(Environment::current()) }
    }

    /// The coroutine the calling thread is currently running (the main one
    /// when nothing has been resumed).
    pub fn current() -> Handle {
        Handle(Environment::current().curr_co())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Coroutine({})",
            self.name.as_deref().unwrap_or("<unnamed>")
        )
    }
}

/// A by-reference handle to a coroutine. The coroutine is owned by whoever
/// spawned it: it is never freed implicitly, and `release` must not be
/// called while it still sits on the call chain.
#[derive(Copy, Clone)]
pub struct Handle(*mut Coroutine);

impl Handle {
    /// Switch into the coroutine; returns when it yields or finishes.
    ///
    /// Fails without switching when the coroutine is finished or when the
    /// call chain is already at its nesting limit. A panic that escaped the
    /// coroutine's entry is re-reported here as `Error::Panicked`.
    pub fn resume(&self) -> ResumeResult {
        let env = Environment::current();
        let co = self.0;
        unsafe {
            debug_assert_eq!((*co).env, env as *mut Environment);
            if (*co).finished {
                return Err(Error::Finished);
            }
            if env.call_chain.len() >= MAX_CALL_CHAIN {
                return Err(Error::CallChainFull);
            }

            let curr = env.curr_co();
            if !(*co).started {
                (*co)
                    .ctx
                    .init(coroutine_entry, co as *mut c_void, ptr::null_mut());
                (*co).started = true;
            }
            env.call_chain.push(co);
            swap(curr, co);

            if let Some(payload) = (*co).panic_payload.take() {
                return Err(Error::Panicked(payload));
            }
            Ok(())
        }
    }

    pub fn is_finished(&self) -> bool {
        unsafe { (*self.0).finished }
    }

    pub fn is_started(&self) -> bool {
        unsafe { (*self.0).started }
    }

    /// Re-arm a started coroutine so it can be resumed from its entry again.
    /// Fresh and main coroutines are left untouched.
    pub fn reset(&self) {
        let co = self.0;
        unsafe {
            if !(*co).started || (*co).is_main {
                return;
            }
            (*co).started = false;
            (*co).finished = false;
            (*co).panic_payload = None;

            free_save_buffer(co);

            if (*co).is_share_stack && (*(*co).stack_mem).occupy_co == co {
                (*(*co).stack_mem).occupy_co = ptr::null_mut();
            }
        }
    }

    /// Free the coroutine and its stack. The caller must have observed it
    /// off the call chain (finished, or never resumed).
    pub fn release(self) {
        let co = self.0;
        unsafe {
            debug_assert!(!(*co).is_main);
            if !(*co).is_share_stack {
                StackMem::free((*co).stack_mem);
            } else {
                free_save_buffer(co);
                if (*(*co).stack_mem).occupy_co == co {
                    (*(*co).stack_mem).occupy_co = ptr::null_mut();
                }
            }
            drop(Box::from_raw(co));
        }
    }

    pub fn set_collab_data(&self, data: *mut c_void) {
        unsafe { (*self.0).collab_data = data }
    }

    pub fn collab_data(&self) -> *mut c_void {
        unsafe { (*self.0).collab_data }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe { (*self.0).fmt(f) }
    }
}

/// First code every coroutine runs. Never returns to its caller: the only
/// way out is the yield after the entry completes.
extern "C" fn coroutine_entry(arg: *mut c_void, _tag: *mut c_void) {
    let co = arg as *mut Coroutine;
    unsafe {
        if let Some(f) = (*co).entry.as_mut() {
            if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(|| f())) {
                let msg = match payload.downcast_ref::<&'static str>() {
                    Some(s) => *s,
                    None => match payload.downcast_ref::<String>() {
                        Some(s) => &s[..],
                        None => "Box<Any>",
                    },
                };
                error!(
                    "coroutine '{}' panicked at '{}'",
                    (*co).name.as_deref().unwrap_or("<unnamed>"),
                    msg
                );
                (*co).panic_payload = Some(payload);
            }
        }
        (*co).finished = true;

        // a finished coroutine must never be switched into again; tolerate
        // the violation by parking forever instead of running off the frame
        loop {
            yield_env(&mut *(*co).env);
        }
    }
}

pub(crate) unsafe fn yield_env(env: &mut Environment) {
    let len = env.call_chain.len();
    if len < 2 {
        warn!("the main coroutine cannot yield");
        return;
    }
    let last = env.call_chain[len - 2];
    let curr = env.call_chain[len - 1];
    env.call_chain.pop();
    swap(curr, last);
}

/// Resume used by event-loop callbacks, where there is nobody to hand the
/// error to.
pub(crate) unsafe fn resume_raw(co: *mut Coroutine) {
    if let Err(e) = Handle(co).resume() {
        error!("failed to resume {:?}: {:?}", Handle(co), e);
    }
}

/// Switch from `curr` to `pending`, doing the shared-stack bookkeeping on
/// both sides of the register swap.
pub(crate) unsafe fn swap(curr: *mut Coroutine, pending: *mut Coroutine) {
    let env = Environment::current() as *mut Environment;

    // where this coroutine's live stack ends, for the eviction copy
    let mut anchor: u8 = 0;
    (*curr).stack_sp = &mut anchor as *mut u8;

    if !(*pending).is_share_stack {
        (*env).pending_co = ptr::null_mut();
        (*env).occupy_co = ptr::null_mut();
    } else {
        (*env).pending_co = pending;

        let occupy = (*(*pending).stack_mem).occupy_co;
        (*(*pending).stack_mem).occupy_co = pending;
        (*env).occupy_co = occupy;

        if !occupy.is_null() && occupy != pending {
            save_stack_buffer(occupy);
        }
    }

    Context::swap(&mut (*curr).ctx, &mut (*pending).ctx);

    // running again; the frame may have been rewritten, so trust nothing
    // captured above and fetch the transfer slots fresh
    let env = Environment::current() as *mut Environment;
    let update_occupy = (*env).occupy_co;
    let update_pending = (*env).pending_co;

    if !update_occupy.is_null() && !update_pending.is_null() && update_occupy != update_pending {
        if !(*update_pending).save_buffer.is_null() && (*update_pending).save_size > 0 {
            ptr::copy_nonoverlapping(
                (*update_pending).save_buffer,
                (*update_pending).stack_sp,
                (*update_pending).save_size,
            );
        }
    }
}

/// Copy the evicted occupant's live stack bytes (from its last recorded
/// stack pointer up to the frame top) into its save buffer.
unsafe fn save_stack_buffer(occupy: *mut Coroutine) {
    let stack_mem = (*occupy).stack_mem;
    let len = (*stack_mem).bp as usize - (*occupy).stack_sp as usize;

    free_save_buffer(occupy);

    (*occupy).save_buffer = alloc(save_layout(len));
    assert!(!(*occupy).save_buffer.is_null());
    (*occupy).save_size = len;

    ptr::copy_nonoverlapping((*occupy).stack_sp, (*occupy).save_buffer, len);
}

unsafe fn free_save_buffer(co: *mut Coroutine) {
    if !(*co).save_buffer.is_null() {
        dealloc((*co).save_buffer, save_layout((*co).save_size));
        (*co).save_buffer = ptr::null_mut();
        (*co).save_size = 0;
    }
}

fn save_layout(len: usize) -> Layout {
    Layout::from_size_align(len.max(1), 1).expect("bad save buffer layout")
}

/// Turn blocking-I/O interception on for the current coroutine.
pub fn enable_sys_hook() {
    unsafe { (*Environment::current().curr_co()).sys_hook = true }
}

/// Turn blocking-I/O interception off for the current coroutine.
pub fn disable_sys_hook() {
    unsafe { (*Environment::current().curr_co()).sys_hook = false }
}

pub fn is_sys_hook_enabled() -> bool {
    unsafe { (*Environment::current().curr_co()).sys_hook }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_resume_and_finish() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let inner = log.clone();
        let coro = Coroutine::spawn(move || {
            inner.borrow_mut().push(1);
        });

        assert!(!coro.is_started());
        coro.resume().ok().expect("failed to resume");
        assert!(coro.is_finished());
        assert_eq!(*log.borrow(), [1]);

        assert!(matches!(coro.resume(), Err(Error::Finished)));
        coro.release();
    }

    #[test]
    fn test_yield_round_trip_preserves_locals() {
        let coro = Coroutine::spawn(|| {
            let x: usize = 0x1234;
            Coroutine::sched();
            assert_eq!(x, 0x1234);
        });

        coro.resume().ok().expect("failed to resume");
        assert!(!coro.is_finished());
        coro.resume().ok().expect("failed to resume");
        assert!(coro.is_finished());
        coro.release();
    }

    #[test]
    fn test_panic_is_reported_to_the_resumer() {
        let coro = Coroutine::spawn(|| {
            panic!("inside");
        });
        match coro.resume() {
            Err(Error::Panicked(payload)) => {
                assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "inside");
            }
            other => panic!("expected a panic report, got {:?}", other.is_ok()),
        }
        assert!(coro.is_finished());
        coro.release();
    }

    #[test]
    fn test_reset_runs_the_entry_again() {
        let log = Rc::new(RefCell::new(0));
        let inner = log.clone();
        let coro = Coroutine::spawn(move || {
            *inner.borrow_mut() += 1;
        });

        coro.resume().ok().expect("failed to resume");
        assert_eq!(*log.borrow(), 1);

        coro.reset();
        assert!(!coro.is_finished());
        coro.resume().ok().expect("failed to resume");
        assert_eq!(*log.borrow(), 2);
        coro.release();
    }

    #[test]
    fn test_nested_resume() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let outer_log = log.clone();
        let outer = Coroutine::spawn(move || {
            outer_log.borrow_mut().push("outer in");
            let inner_log = outer_log.clone();
            let inner = Coroutine::spawn(move || {
                inner_log.borrow_mut().push("inner");
            });
            inner.resume().ok().expect("failed to resume");
            inner.release();
            outer_log.borrow_mut().push("outer out");
        });

        outer.resume().ok().expect("failed to resume");
        assert_eq!(*log.borrow(), ["outer in", "inner", "outer out"]);
        outer.release();
    }

    #[test]
    fn test_call_chain_depth_limit() {
        fn dive(depth: usize, overflowed: Rc<RefCell<bool>>) {
            let coro = Coroutine::spawn(move || {
                let env_depth = Environment::current().depth();
                if env_depth < MAX_CALL_CHAIN {
                    dive(depth + 1, overflowed.clone());
                } else {
                    // one more nested resume must fail without switching
                    let inner = Coroutine::spawn(|| {});
                    match inner.resume() {
                        Err(Error::CallChainFull) => *overflowed.borrow_mut() = true,
                        other => panic!("expected CallChainFull, got ok={}", other.is_ok()),
                    }
                    inner.release();
                }
            });
            coro.resume().ok().expect("failed to resume");
            coro.release();
        }

        let overflowed = Rc::new(RefCell::new(false));
        dive(1, overflowed.clone());
        assert!(*overflowed.borrow());
    }
}
