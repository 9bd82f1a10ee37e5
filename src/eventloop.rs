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

//! The event loop that drives suspended coroutines back to runnable.
//!
//! `EventCore` bundles the readiness poller, the timing wheel, and the two
//! dispatch lists. One loop iteration polls with a short tick, sorts fired
//! waiters onto the active list (readiness first, then everything the wheel
//! has drained), and dispatches: each waiter's `process` callback resumes the
//! coroutine that parked it. Waiters flagged timed-out whose deadline is
//! still ahead (requeued, or the clock stepped) go back into the wheel
//! instead of firing.

use std::io;
use std::os::raw::{c_int, c_short, c_void};
use std::ptr;
use std::time::Duration;

use log::warn;

use crate::coroutine::{resume_raw, yield_env, Coroutine};
use crate::environment::Environment;
use crate::hook::set_errno;
use crate::list::{self, LinkList};
use crate::poller::Poller;
use crate::timer::{now_ms, Timeout, TimeoutItem, DEFAULT_WHEEL_SIZE};

/// Readiness notifications accepted per poll round.
const EVENT_CAPACITY: usize = 1024 * 10;

/// Poll tick, which is also the effective timer resolution.
const TICK_MS: u64 = 1;

pub struct EventCore {
    pub(crate) poller: Poller,
    pub(crate) timeout: Timeout,
    timeout_list: LinkList<TimeoutItem>,
    pub(crate) active_list: LinkList<TimeoutItem>,
}

impl EventCore {
    pub(crate) fn new() -> io::Result<EventCore> {
        Ok(EventCore {
            poller: Poller::new(EVENT_CAPACITY)?,
            timeout: Timeout::new(DEFAULT_WHEEL_SIZE),
            timeout_list: LinkList::new(),
            active_list: LinkList::new(),
        })
    }
}

/// Run the calling thread's event loop until `tick` returns `false`. The
/// tick callback runs once per iteration, after dispatch.
pub fn event_loop<F>(mut tick: F)
where
    F: FnMut() -> bool,
{
    let env = Environment::current();
    let core = env.event_core_ptr();
    let mut fired: Vec<(*mut TimeoutItem, c_short)> = Vec::with_capacity(EVENT_CAPACITY);

    unsafe {
        loop {
            fired.clear();
            (*core).poller.poll(Duration::from_millis(TICK_MS), &mut fired);

            for &(item, revents) in fired.iter() {
                match (*item).prepare {
                    Some(prepare) => prepare(item, revents, &mut (*core).active_list),
                    None => (*core).active_list.push_tail(item),
                }
            }

            let now = now_ms();
            {
                let core = &mut *core;
                core.timeout.take_all(now, &mut core.timeout_list);

                let mut lp = core.timeout_list.head();
                while !lp.is_null() {
                    (*lp).timed_out = true;
                    lp = (*lp).links.next;
                }

                core.active_list.join(&mut core.timeout_list);
            }

            loop {
                let lp = (*core).active_list.pop_head();
                if lp.is_null() {
                    break;
                }

                // flagged by the drain, but the deadline is still ahead:
                // requeued while parked, or the clock stepped backwards
                if (*lp).timed_out && now < (*lp).expire_time {
                    if (*core).timeout.add(lp, now).is_ok() {
                        (*lp).timed_out = false;
                        continue;
                    }
                }

                if let Some(process) = (*lp).process {
                    process(lp);
                }
            }

            if !tick() {
                break;
            }
        }
    }
}

/// Dispatch callback for plain timer waiters: resume the parked coroutine.
pub(crate) unsafe fn on_coroutine_event(item: *mut TimeoutItem) {
    resume_raw((*item).arg as *mut Coroutine);
}

// ---------------------------------------------------------------------------
// poll-group suspension
// ---------------------------------------------------------------------------

pub(crate) type RawPollFn = unsafe fn(*mut libc::pollfd, libc::nfds_t, c_int) -> c_int;

/// The waiter for one intercepted `poll` call: the base timer entry plus the
/// working copy of the caller's pollfd array and one sub-waiter per fd. The
/// base item must stay the first field; both structs travel through the
/// dispatch lists as `*mut TimeoutItem`.
#[repr(C)]
struct PollGroup {
    timeout: TimeoutItem,

    fds: *mut libc::pollfd,
    nfds: libc::nfds_t,
    items: *mut PollItem,

    /// The first readiness hit detaches the whole group from the wheel;
    /// later hits in the same round only accumulate.
    all_event_detach: bool,
    raise_cnt: c_int,
}

#[repr(C)]
struct PollItem {
    timeout: TimeoutItem,

    /// The slot in the group's pollfd copy this fd reports into.
    self_fd: *mut libc::pollfd,
    group: *mut PollGroup,

    /// Poller registration, -1 when registration failed or was skipped.
    token: isize,
}

/// Readiness fired for one fd of a poll group: record the bits, count the
/// hit, and enqueue the group exactly once.
unsafe fn on_poll_prepare(item: *mut TimeoutItem, revents: c_short, active: &mut LinkList<TimeoutItem>) {
    let item = item as *mut PollItem;
    (*(*item).self_fd).revents = revents;

    let group = (*item).group;
    (*group).raise_cnt += 1;

    if !(*group).all_event_detach {
        (*group).all_event_detach = true;
        list::remove(&mut (*group).timeout as *mut TimeoutItem);
        active.push_tail(&mut (*group).timeout);
    }
}

unsafe fn on_poll_process(item: *mut TimeoutItem) {
    resume_raw((*item).arg as *mut Coroutine);
}

/// Park the current coroutine until one of `fds` is ready or `timeout`
/// milliseconds pass. This is the suspension point every blocking-I/O shim
/// funnels through.
///
/// `timeout == 0` short-circuits to the real call; a negative timeout means
/// "wait forever" and is rewritten to a very large positive one. Returns the
/// number of fds with events, 0 on timeout, -1 with `errno` set when the
/// deadline could not be queued.
pub(crate) unsafe fn poll_inner(
    fds: *mut libc::pollfd,
    nfds: libc::nfds_t,
    timeout: c_int,
    fallback: Option<RawPollFn>,
) -> c_int {
    if timeout == 0 {
        return match fallback {
            Some(f) => f(fds, nfds, timeout),
            None => libc::poll(fds, nfds, timeout),
        };
    }
    let timeout = if timeout < 0 { c_int::MAX } else { timeout };

    let env = Environment::current();
    let core = env.event_core_ptr();
    let self_co = env.curr_co();

    let n = nfds as usize;

    // working copy of the caller's array; prepare callbacks write into it
    let mut fds_vec: Vec<libc::pollfd> = Vec::with_capacity(n);
    for i in 0..n {
        fds_vec.push(*fds.add(i));
    }
    let fds_ptr = Box::into_raw(fds_vec.into_boxed_slice()) as *mut libc::pollfd;

    let group = Box::into_raw(Box::new(PollGroup {
        timeout: TimeoutItem::new(),
        fds: fds_ptr,
        nfds,
        items: ptr::null_mut(),
        all_event_detach: false,
        raise_cnt: 0,
    }));
    (*group).timeout.process = Some(on_poll_process);
    (*group).timeout.arg = self_co as *mut c_void;

    let mut items_vec: Vec<PollItem> = Vec::with_capacity(n);
    for i in 0..n {
        items_vec.push(PollItem {
            timeout: TimeoutItem::new(),
            self_fd: fds_ptr.add(i),
            group,
            token: -1,
        });
    }
    let items_ptr = Box::into_raw(items_vec.into_boxed_slice()) as *mut PollItem;
    (*group).items = items_ptr;

    for i in 0..n {
        let item = items_ptr.add(i);
        (*item).timeout.prepare = Some(on_poll_prepare);
        (*item).timeout.arg = self_co as *mut c_void;

        let pf = fds_ptr.add(i);
        if (*pf).fd > -1 {
            match (*core)
                .poller
                .add((*pf).fd, (*pf).events, item as *mut TimeoutItem)
            {
                Ok(token) => (*item).token = token as isize,
                Err(e) => {
                    // a non-pollable fd: hand the whole call to the real poll
                    if e.raw_os_error() == Some(libc::EPERM) && nfds == 1 && fallback.is_some() {
                        free_poll_group(group);
                        return fallback.unwrap()(fds, nfds, timeout);
                    }
                    warn!(
                        "readiness registration for fd {} failed: {}; the timeout still applies",
                        (*pf).fd,
                        e
                    );
                }
            }
        }
    }

    let now = now_ms();
    (*group).timeout.expire_time = now + timeout as u64;

    let raise_cnt;
    if (*core).timeout.add(&mut (*group).timeout, now).is_err() {
        set_errno(libc::EINVAL);
        raise_cnt = -1;
    } else {
        yield_env(env);
        raise_cnt = (*group).raise_cnt;
    }

    // woken (readiness, timeout, or not parked at all): undo every
    // registration exactly once and report the observed events
    list::remove(&mut (*group).timeout as *mut TimeoutItem);
    for i in 0..n {
        let item = items_ptr.add(i);
        if (*item).token >= 0 {
            (*core).poller.del((*fds.add(i)).fd, (*item).token as usize);
        }
        (*fds.add(i)).revents = (*fds_ptr.add(i)).revents;
    }

    free_poll_group(group);
    raise_cnt
}

unsafe fn free_poll_group(group: *mut PollGroup) {
    let g = Box::from_raw(group);
    let n = g.nfds as usize;
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(g.items, n)));
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(g.fds, n)));
}
