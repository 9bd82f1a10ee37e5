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

//! Hashed timing wheel.
//!
//! A fixed ring of intrusive lists keyed by deadline offset in milliseconds.
//! One bucket per millisecond gives a 60 second horizon at the default size;
//! deadlines beyond the horizon are clamped into the last bucket, so a waiter
//! can fire later than asked but never earlier.

use std::os::raw::{c_short, c_void};
use std::ptr;
use std::sync::OnceLock;
use std::time::Instant;

use log::warn;

use crate::list::{LinkList, Linked, Links};

/// Default bucket count: 1 ms granularity over a 60 s horizon.
pub const DEFAULT_WHEEL_SIZE: usize = 60 * 1000;

/// Runs when readiness fires for a waiter, before it is dispatched. May
/// translate readiness bits, detach the waiter from the wheel and append it
/// (or its owner) to the active list.
pub type PrepareFn = unsafe fn(item: *mut TimeoutItem, revents: c_short, active: &mut LinkList<TimeoutItem>);

/// Runs when a waiter is dispatched; resumes the parked coroutine.
pub type ProcessFn = unsafe fn(item: *mut TimeoutItem);

/// One suspended wait: a deadline, list links, and the callbacks that carry
/// the parked coroutine back to runnable. Specialized waiters embed this as
/// their first field (`#[repr(C)]`) and cast.
#[repr(C)]
pub struct TimeoutItem {
    pub links: Links<TimeoutItem>,

    /// Absolute deadline in `now_ms` time.
    pub expire_time: u64,

    pub prepare: Option<PrepareFn>,
    pub process: Option<ProcessFn>,

    /// The parked coroutine.
    pub arg: *mut c_void,

    /// Set when the wheel drained this item rather than readiness.
    pub timed_out: bool,
}

impl TimeoutItem {
    pub fn new() -> TimeoutItem {
        TimeoutItem {
            links: Links::new(),
            expire_time: 0,
            prepare: None,
            process: None,
            arg: ptr::null_mut(),
            timed_out: false,
        }
    }
}

impl Linked for TimeoutItem {
    fn links(&mut self) -> &mut Links<TimeoutItem> {
        &mut self.links
    }
}

/// The wheel itself. `start` is the millisecond the ring origin corresponds
/// to, `start_idx` the origin's rotation index; both advance on drain.
pub struct Timeout {
    items: Vec<LinkList<TimeoutItem>>,
    size: u64,
    start: u64,
    start_idx: u64,
}

impl Timeout {
    pub fn new(size: usize) -> Timeout {
        let mut items = Vec::with_capacity(size);
        for _ in 0..size {
            items.push(LinkList::new());
        }
        Timeout {
            items,
            size: size as u64,
            start: now_ms(),
            start_idx: 0,
        }
    }

    /// Insert `item` into the bucket for its deadline. A deadline already in
    /// the past is refused; a deadline beyond the horizon lands in the last
    /// bucket.
    pub unsafe fn add(&mut self, item: *mut TimeoutItem, now: u64) -> Result<(), ()> {
        if self.start == 0 {
            self.start = now;
            self.start_idx = 0;
        }
        if now < self.start {
            warn!("timer add: now {} is before wheel origin {}", now, self.start);
            return Err(());
        }
        if (*item).expire_time < now {
            warn!(
                "timer add: deadline {} already passed (now {})",
                (*item).expire_time,
                now
            );
            return Err(());
        }

        let mut diff = (*item).expire_time - self.start;
        if diff >= self.size {
            diff = self.size - 1;
            warn!(
                "timer add: deadline {} beyond the {} ms horizon, clamped into the last bucket",
                (*item).expire_time,
                self.size
            );
        }

        let idx = ((self.start_idx + diff) % self.size) as usize;
        self.items[idx].push_tail(item);
        Ok(())
    }

    /// Splice every bucket with a deadline at or before `now` onto `result`
    /// and advance the origin to `now`.
    pub unsafe fn take_all(&mut self, now: u64, result: &mut LinkList<TimeoutItem>) {
        if self.start == 0 {
            self.start = now;
            self.start_idx = 0;
        }
        if now < self.start {
            return;
        }

        let mut cnt = now - self.start + 1;
        if cnt > self.size {
            cnt = self.size;
        }
        for i in 0..cnt {
            let idx = ((self.start_idx + i) % self.size) as usize;
            result.join(&mut self.items[idx]);
        }
        self.start = now;
        self.start_idx += cnt - 1;
    }
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since a process-local epoch. All deadlines are
/// expressed on this clock.
pub fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(test)]
mod test {
    use super::*;

    unsafe fn drain(list: &mut LinkList<TimeoutItem>) -> Vec<*mut TimeoutItem> {
        let mut out = Vec::new();
        loop {
            let lp = list.pop_head();
            if lp.is_null() {
                break;
            }
            out.push(lp);
        }
        out
    }

    #[test]
    fn test_fires_in_deadline_order() {
        unsafe {
            let mut wheel = Timeout::new(100);
            let now = now_ms();
            wheel.start = now;

            let mut a = TimeoutItem::new();
            let mut b = TimeoutItem::new();
            a.expire_time = now + 10;
            b.expire_time = now + 20;
            wheel.add(&mut b, now).unwrap();
            wheel.add(&mut a, now).unwrap();

            let mut fired = LinkList::new();
            wheel.take_all(now + 5, &mut fired);
            assert!(fired.is_empty());

            wheel.take_all(now + 15, &mut fired);
            assert_eq!(drain(&mut fired), [&mut a as *mut TimeoutItem]);

            wheel.take_all(now + 30, &mut fired);
            assert_eq!(drain(&mut fired), [&mut b as *mut TimeoutItem]);
        }
    }

    #[test]
    fn test_past_deadline_refused() {
        unsafe {
            let mut wheel = Timeout::new(100);
            let now = now_ms() + 50;
            let mut item = TimeoutItem::new();
            item.expire_time = now - 1;
            assert!(wheel.add(&mut item, now).is_err());
        }
    }

    #[test]
    fn test_horizon_clamped_into_last_bucket() {
        unsafe {
            let size = 64;
            let mut wheel = Timeout::new(size);
            let now = wheel.start;

            let mut item = TimeoutItem::new();
            item.expire_time = now + 10 * size as u64;
            wheel.add(&mut item, now).unwrap();

            // nothing before the horizon
            let mut fired = LinkList::new();
            wheel.take_all(now + size as u64 - 2, &mut fired);
            assert!(fired.is_empty());

            // drained once the wheel has swept its full span
            wheel.take_all(now + size as u64, &mut fired);
            assert_eq!(drain(&mut fired).len(), 1);
        }
    }

    #[test]
    fn test_wrap_around_exact_slot() {
        unsafe {
            let size: u64 = 60;
            let mut wheel = Timeout::new(size as usize);
            let now = wheel.start;

            // rotate the wheel part-way so insertion wraps modulo the ring
            let mut fired = LinkList::new();
            wheel.take_all(now + 40, &mut fired);
            assert!(fired.is_empty());

            let now = now + 40;
            let mut item = TimeoutItem::new();
            item.expire_time = now + size - 1;
            wheel.add(&mut item, now).unwrap();

            wheel.take_all(now + size - 2, &mut fired);
            assert!(fired.is_empty());

            wheel.take_all(now + size, &mut fired);
            assert_eq!(drain(&mut fired).len(), 1);
        }
    }

    #[test]
    fn test_now_ms_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
