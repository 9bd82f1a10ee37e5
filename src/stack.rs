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

//! Coroutine stack frames.
//!
//! A frame is a plain heap buffer; independent coroutines own one each, and a
//! `ShareStack` hands a fixed set of frames out round-robin so that many
//! mostly-idle coroutines can share a few large buffers. In shared mode the
//! resume path saves the evicted occupant's live stack bytes and restores
//! them when that coroutine next runs, so no live pointers into a shared
//! frame may be kept across a yield.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::Cell;

use crate::coroutine::Coroutine;

pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;
pub const MIN_STACK_SIZE: usize = 4 * 1024;
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

const PAGE: usize = 0x1000;

/// One stack frame: `[buffer, bp)` with `bp` the high end. In shared mode
/// `occupy_co` is the coroutine whose live bytes are currently laid out in
/// the buffer.
pub struct StackMem {
    pub occupy_co: *mut Coroutine,
    pub size: usize,
    pub buffer: *mut u8,
    pub bp: *mut u8,
}

impl StackMem {
    /// Allocate a frame of exactly `size` bytes (the caller normalizes).
    /// The record has a stable address; free it with `StackMem::free`.
    pub fn alloc(size: usize) -> *mut StackMem {
        let buffer = unsafe { alloc(stack_layout(size)) };
        assert!(!buffer.is_null(), "failed to allocate a {} byte stack", size);
        Box::into_raw(Box::new(StackMem {
            occupy_co: std::ptr::null_mut(),
            size,
            buffer,
            bp: unsafe { buffer.add(size) },
        }))
    }

    pub unsafe fn free(mem: *mut StackMem) {
        let mem = Box::from_raw(mem);
        dealloc(mem.buffer, stack_layout(mem.size));
    }
}

fn stack_layout(size: usize) -> Layout {
    // 4K aligned, like the pages it stands in for
    Layout::from_size_align(size, PAGE).expect("bad stack layout")
}

/// Clamp a requested stack size into [4 KiB, 8 MiB] (0 means the default)
/// and round up to a 4 KiB multiple.
pub fn normalize_stack_size(size: usize) -> usize {
    let size = if size == 0 {
        DEFAULT_STACK_SIZE
    } else if size > MAX_STACK_SIZE {
        MAX_STACK_SIZE
    } else if size < MIN_STACK_SIZE {
        MIN_STACK_SIZE
    } else {
        size
    };
    round_up(size, PAGE)
}

// Round up `from` to be divisible by `to`
fn round_up(from: usize, to: usize) -> usize {
    if from % to == 0 {
        from
    } else {
        from + to - (from % to)
    }
}

/// A pool of frames shared by many coroutines. Assignment is round-robin;
/// conflicts are resolved by the save/restore dance in the switch, not here.
pub struct ShareStack {
    alloc_idx: Cell<usize>,
    stack_size: usize,
    mems: Vec<*mut StackMem>,
}

impl ShareStack {
    pub fn new(count: usize, stack_size: usize) -> ShareStack {
        assert!(count > 0, "a share stack needs at least one frame");
        let stack_size = normalize_stack_size(stack_size);
        let mems = (0..count).map(|_| StackMem::alloc(stack_size)).collect();
        ShareStack {
            alloc_idx: Cell::new(0),
            stack_size,
            mems,
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Hand out the next frame; the cursor wraps over the pool.
    pub(crate) fn get_mem(&self) -> *mut StackMem {
        let idx = self.alloc_idx.get();
        self.alloc_idx.set(idx.wrapping_add(1));
        self.mems[idx % self.mems.len()]
    }
}

impl Drop for ShareStack {
    fn drop(&mut self) {
        for &mem in &self.mems {
            unsafe { StackMem::free(mem) };
        }
    }
}
