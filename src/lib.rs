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

//! Stackful coroutine runtime with an event loop and transparent blocking
//! I/O.
//!
//! Each OS thread hosts its own runtime: a call chain of nested coroutines,
//! a readiness poller and a timing wheel. Coroutines are resumed and yield
//! cooperatively; code that would block on a file descriptor can instead go
//! through the [`hook`] wrappers, which park the coroutine until the fd is
//! ready or a timeout fires while the thread keeps running other coroutines.
//!
//! ```rust
//! use coro::{spawn, sched};
//!
//! let coro = spawn(|| {
//!     println!("Before yield");
//!
//!     // Yield back to its parent who resumed this coroutine
//!     sched();
//!
//!     println!("I am back!");
//! });
//!
//! // Starts the Coroutine
//! coro.resume().ok().expect("Failed to resume");
//!
//! println!("Back to main");
//!
//! // Resume it
//! coro.resume().ok().expect("Failed to resume");
//!
//! println!("Coroutine finished");
//! coro.release();
//! ```

use std::any::Any;
use std::fmt;

pub use crate::builder::Builder;
pub use crate::coroutine::{
    disable_sys_hook, enable_sys_hook, is_sys_hook_enabled, Coroutine, Handle,
};
pub use crate::environment::Environment;
pub use crate::eventloop::event_loop;
pub use crate::options::Options;
pub use crate::specific::{get_specific, set_specific};
pub use crate::stack::ShareStack;
pub use crate::sync::Cond;

mod builder;
mod context;
mod coroutine;
mod environment;
mod eventloop;
pub mod hook;
mod list;
mod options;
mod poller;
mod specific;
mod stack;
pub mod sync;
mod timer;


/// Why a `resume` did not hand control to the coroutine (or handed it back
/// abnormally).
pub enum Error {
    /// The call chain is already at its nesting limit; no switch happened.
    CallChainFull,
    /// The coroutine has already finished; no switch happened.
    Finished,
    /// The coroutine's entry panicked; the payload is passed along.
    Panicked(Box<dyn Any + Send>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CallChainFull => write!(f, "CallChainFull"),
            Error::Finished => write!(f, "Finished"),
            Error::Panicked(..) => write!(f, "Panicked(..)"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CallChainFull => write!(f, "the call chain is at its nesting limit"),
            Error::Finished => write!(f, "the coroutine has already finished"),
            Error::Panicked(..) => write!(f, "the coroutine panicked"),
        }
    }
}

impl std::error::Error for Error {}

/// Return type of resuming.
///
/// See `Handle::resume` for more detail.
pub type ResumeResult = std::result::Result<(), Error>;

/// Spawn a new Coroutine
///
/// Equivalent to `Coroutine::spawn`.
pub fn spawn<F>(f: F) -> Handle
where
    F: FnMut() + 'static,
{
    Coroutine::spawn(f)
}

/// Yield the current Coroutine
///
/// Equivalent to `Coroutine::sched`.
pub fn sched() {
    Coroutine::sched()
}

/// Get the current Coroutine
///
/// Equivalent to `Coroutine::current`.
pub fn current() -> Handle {
    Coroutine::current()
}

/// Resume a Coroutine
///
/// Equivalent to `Handle::resume`.
pub fn resume(coro: &Handle) -> ResumeResult {
    coro.resume()
}
