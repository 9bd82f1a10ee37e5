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

//! Coroutine condition variable.
//!
//! Waiters park in a FIFO queue, optionally with a deadline in the timing
//! wheel. `signal` lifts the oldest waiter out of both and hands it to the
//! event loop's active list, so the wake happens on the next dispatch.

use std::cell::UnsafeCell;
use std::os::raw::{c_int, c_void};

use crate::coroutine::yield_env;
use crate::environment::Environment;
use crate::eventloop::on_coroutine_event;
use crate::list::{self, LinkList, Linked, Links};
use crate::timer::{now_ms, TimeoutItem};

struct CondItem {
    links: Links<CondItem>,
    timeout: TimeoutItem,
}

impl Linked for CondItem {
    fn links(&mut self) -> &mut Links<CondItem> {
        &mut self.links
    }
}

/// A condition variable for coroutines on one thread.
///
/// Must not be dropped while coroutines are still waiting on it.
pub struct Cond {
    // boxed so the queue keeps its address even if the Cond value moves
    wait_list: Box<UnsafeCell<LinkList<CondItem>>>,
}

impl Cond {
    pub fn new() -> Cond {
        Cond {
            wait_list: Box::new(UnsafeCell::new(LinkList::new())),
        }
    }

    /// Park the current coroutine until signalled, or for `timeout_ms`
    /// milliseconds when positive (zero or negative waits indefinitely).
    /// Returns true when the wake came from a signal, false on timeout.
    pub fn wait(&self, timeout_ms: c_int) -> bool {
        let env = Environment::current();
        let core = env.event_core_ptr();

        unsafe {
            let item = Box::into_raw(Box::new(CondItem {
                links: Links::new(),
                timeout: TimeoutItem::new(),
            }));
            (*item).timeout.arg = env.curr_co() as *mut c_void;
            (*item).timeout.process = Some(on_coroutine_event);

            if timeout_ms > 0 {
                let now = now_ms();
                (*item).timeout.expire_time = now + timeout_ms as u64;
                if (*core).timeout.add(&mut (*item).timeout, now).is_err() {
                    drop(Box::from_raw(item));
                    return false;
                }
            }

            (*self.wait_list.get()).push_tail(item);

            yield_env(env);

            // woken: by a signal (already dequeued) or by the wheel
            list::remove(item);
            let signalled = !(*item).timeout.timed_out;
            drop(Box::from_raw(item));
            signalled
        }
    }

    /// Wake the oldest waiter, if any. The waiter runs on the next event
    /// loop dispatch, not inline.
    pub fn signal(&self) {
        let env = Environment::current();
        let core = env.event_core_ptr();
        unsafe {
            let item = (*self.wait_list.get()).pop_head();
            if item.is_null() {
                return;
            }
            list::remove(&mut (*item).timeout as *mut TimeoutItem);
            (*core).active_list.push_tail(&mut (*item).timeout);
        }
    }

    /// Wake every waiter, preserving FIFO order.
    pub fn broadcast(&self) {
        let env = Environment::current();
        let core = env.event_core_ptr();
        unsafe {
            loop {
                let item = (*self.wait_list.get()).pop_head();
                if item.is_null() {
                    return;
                }
                list::remove(&mut (*item).timeout as *mut TimeoutItem);
                (*core).active_list.push_tail(&mut (*item).timeout);
            }
        }
    }
}

impl Default for Cond {
    fn default() -> Cond {
        Cond::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coroutine::Coroutine;
    use crate::eventloop::event_loop;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_wait_times_out() {
        let result = Rc::new(RefCell::new(None));
        let cond = Rc::new(Cond::new());

        let inner = result.clone();
        let c = cond.clone();
        let coro = Coroutine::spawn(move || {
            *inner.borrow_mut() = Some(c.wait(30));
        });
        coro.resume().ok().expect("failed to resume");

        let start = now_ms();
        let flag = result.clone();
        event_loop(move || flag.borrow().is_none() && now_ms() - start < 5_000);

        assert_eq!(*result.borrow(), Some(false));
        assert!(now_ms() - start >= 30);
        coro.release();
    }

    #[test]
    fn test_signal_wakes_in_fifo_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let cond = Rc::new(Cond::new());

        let mut waiters = Vec::new();
        for id in 0..3 {
            let log = order.clone();
            let c = cond.clone();
            let coro = Coroutine::spawn(move || {
                assert!(c.wait(-1));
                log.borrow_mut().push(id);
            });
            coro.resume().ok().expect("failed to resume");
            waiters.push(coro);
        }

        let signaller_cond = cond.clone();
        let signaller = Coroutine::spawn(move || {
            signaller_cond.signal();
            signaller_cond.broadcast();
        });
        signaller.resume().ok().expect("failed to resume");

        let start = now_ms();
        let flag = order.clone();
        event_loop(move || flag.borrow().len() < 3 && now_ms() - start < 5_000);

        assert_eq!(*order.borrow(), [0, 1, 2]);
        for coro in waiters {
            coro.release();
        }
        signaller.release();
    }
}
