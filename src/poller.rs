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

//! Readiness multiplexer.
//!
//! A thin, poll-bits-shaped interface over `mio::Poll`: waiters register a
//! raw fd with the `POLLIN`/`POLLOUT` bits they care about and get a token
//! back; one poll round reports `(waiter, revents)` pairs with platform
//! readiness translated back to poll bits. Error and hang-up conditions are
//! always reported, as with the underlying primitives.

use std::io;
use std::os::raw::c_short;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::warn;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::timer::TimeoutItem;

pub struct Poller {
    poll: Poll,
    events: Events,
    tokens: Slab<*mut TimeoutItem>,
}

impl Poller {
    pub fn new(capacity: usize) -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            tokens: Slab::new(),
        })
    }

    /// Register `fd` for the readiness named by the poll bits in `events`,
    /// on behalf of `item`. Returns the registration token.
    pub fn add(&mut self, fd: RawFd, events: c_short, item: *mut TimeoutItem) -> io::Result<usize> {
        let mut interest = None;
        if events & libc::POLLIN != 0 {
            interest = Some(Interest::READABLE);
        }
        if events & libc::POLLOUT != 0 {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        // err/hup-only waits still need a registration to ride on
        let interest = interest.unwrap_or(Interest::READABLE);

        let entry = self.tokens.vacant_entry();
        let token = entry.key();
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), interest)
        {
            Ok(()) => {
                entry.insert(item);
                Ok(token)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a registration made by `add`.
    pub fn del(&mut self, fd: RawFd, token: usize) {
        if self.tokens.contains(token) {
            self.tokens.remove(token);
        }
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            // the fd may already be closed; epoll then dropped it for us
            if e.raw_os_error() != Some(libc::ENOENT) && e.raw_os_error() != Some(libc::EBADF) {
                warn!("deregister fd {} failed: {}", fd, e);
            }
        }
    }

    /// Run one poll round with the given tick and push `(waiter, revents)`
    /// for every readiness notification onto `out`.
    pub fn poll(&mut self, timeout: Duration, out: &mut Vec<(*mut TimeoutItem, c_short)>) {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                warn!("poll failed: {}", e);
                return;
            }
        }

        for event in self.events.iter() {
            let token = event.token().0;
            let item = match self.tokens.get(token) {
                Some(&item) => item,
                None => {
                    warn!("no waiter is registered on token {:?}", token);
                    continue;
                }
            };

            let mut revents: c_short = 0;
            if event.is_readable() {
                revents |= libc::POLLIN;
            }
            if event.is_writable() {
                revents |= libc::POLLOUT;
            }
            if event.is_error() {
                revents |= libc::POLLERR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                revents |= libc::POLLHUP;
            }
            out.push((item, revents));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::ptr;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_reports_readable_to_the_registered_waiter() {
        let (rd, wr) = pipe();
        let mut poller = Poller::new(16).unwrap();

        let marker = 0x5150usize as *mut TimeoutItem;
        let token = poller.add(rd, libc::POLLIN, marker).unwrap();

        let mut fired = Vec::new();
        poller.poll(Duration::from_millis(1), &mut fired);
        assert!(fired.is_empty());

        let ret = unsafe { libc::write(wr, b"x".as_ptr() as *const _, 1) };
        assert_eq!(ret, 1);

        // give the kernel a tick to report it
        for _ in 0..100 {
            poller.poll(Duration::from_millis(10), &mut fired);
            if !fired.is_empty() {
                break;
            }
        }
        assert_eq!(fired.len(), 1);
        let (item, revents) = fired[0];
        assert_eq!(item, marker);
        assert!(revents & libc::POLLIN != 0);

        poller.del(rd, token);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_deregistered_fd_stays_silent() {
        let (rd, wr) = pipe();
        let mut poller = Poller::new(16).unwrap();

        let token = poller.add(rd, libc::POLLIN, ptr::null_mut()).unwrap();
        poller.del(rd, token);

        let ret = unsafe { libc::write(wr, b"x".as_ptr() as *const _, 1) };
        assert_eq!(ret, 1);

        let mut fired = Vec::new();
        poller.poll(Duration::from_millis(20), &mut fired);
        assert!(fired.is_empty());

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
