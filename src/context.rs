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

//! Register-level context switching.
//!
//! `Context` holds one suspended execution: a register file plus the bounds
//! of the stack it runs on. `Context::swap` stores the caller's registers and
//! return address into the outgoing record, installs the incoming record and
//! returns "into" it; when the other side later swaps back, the original call
//! appears to simply return. A freshly `init`ed context returns into the
//! entry function instead, with the two argument registers preloaded.

use std::mem;
use std::os::raw::c_void;
use std::ptr;

/// Entry signature installed into a fresh context. The first argument is the
/// coroutine pointer, the second a tag kept for signature stability (always
/// null).
pub type EntryFn = extern "C" fn(*mut c_void, *mut c_void);

#[cfg(target_arch = "x86_64")]
const NUM_REGS: usize = 14;
#[cfg(target_arch = "x86")]
const NUM_REGS: usize = 8;

// x86_64 slots:
// | regs[0]: r15 | regs[1]: r14 | regs[2]: r13  | regs[3]: r12  |
// | regs[4]: r9  | regs[5]: r8  | regs[6]: rbp  | regs[7]: rdi  |
// | regs[8]: rsi | regs[9]: ret | regs[10]: rdx | regs[11]: rcx |
// | regs[12]: rbx | regs[13]: rsp |
#[cfg(target_arch = "x86_64")]
const RDI: usize = 7;
#[cfg(target_arch = "x86_64")]
const RSI: usize = 8;
#[cfg(target_arch = "x86_64")]
const RET: usize = 9;
#[cfg(target_arch = "x86_64")]
const RSP: usize = 13;

// x86 slots:
// | regs[0]: ret | regs[1]: ebx | regs[2]: ecx | regs[3]: edx |
// | regs[4]: edi | regs[5]: esi | regs[6]: ebp | regs[7]: esp |
#[cfg(target_arch = "x86")]
const ESP: usize = 7;

/// Saved CPU state for one coroutine. `regs` must stay the first field: the
/// swap routine treats the struct address as the address of the register
/// array.
#[repr(C)]
pub struct Context {
    regs: [usize; NUM_REGS],
    ss_sp: *mut u8,
    ss_size: usize,
}

impl Context {
    pub fn empty() -> Context {
        Context {
            regs: [0; NUM_REGS],
            ss_sp: ptr::null_mut(),
            ss_size: 0,
        }
    }

    /// Record the stack this context will run on. Must be called before
    /// `init`.
    pub fn set_stack(&mut self, sp: *mut u8, size: usize) {
        self.ss_sp = sp;
        self.ss_size = size;
    }

    /// Build a fresh frame on the recorded stack so that the first swap into
    /// this context enters `pfn(s, s1)`.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn init(&mut self, pfn: EntryFn, s: *mut c_void, s1: *mut c_void) {
        let mut sp = self.ss_sp.add(self.ss_size - mem::size_of::<usize>());
        sp = ((sp as usize) & !0xF) as *mut u8;

        self.regs = [0; NUM_REGS];
        *(sp as *mut usize) = pfn as usize;

        self.regs[RSP] = sp as usize;
        self.regs[RET] = pfn as usize;
        self.regs[RDI] = s as usize;
        self.regs[RSI] = s1 as usize;
    }

    /// Build a fresh frame on the recorded stack so that the first swap into
    /// this context enters `pfn(s, s1)`. The i386 frame keeps the two
    /// arguments in a parameter area just above the return slot, per the
    /// cdecl convention.
    #[cfg(target_arch = "x86")]
    pub unsafe fn init(&mut self, pfn: EntryFn, s: *mut c_void, s1: *mut c_void) {
        let word = mem::size_of::<usize>();
        let mut sp = self.ss_sp.add(self.ss_size - 2 * word);
        sp = ((sp as usize) & !0xF) as *mut u8;

        let param = sp as *mut usize;
        *param = s as usize;
        *param.add(1) = s1 as usize;

        let ret_addr = sp.sub(2 * word) as *mut usize;
        *ret_addr = pfn as usize;

        self.regs = [0; NUM_REGS];
        self.regs[ESP] = ret_addr as usize;
    }

    /// Save the caller into `from`, install `to`, and resume it.
    pub unsafe fn swap(from: *mut Context, to: *mut Context) {
        coro_swap_registers(from, to);
    }
}

extern "C" {
    fn coro_swap_registers(from: *mut Context, to: *mut Context);
}

// Stores every slot of the outgoing record (including the return address
// sitting at the top of the caller's stack), reloads the incoming record,
// re-pushes its saved return address and returns through it. rdi/rsi are
// restored last so that a fresh context enters its function with both
// argument registers loaded.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .globl coro_swap_registers
    .type coro_swap_registers, @function
coro_swap_registers:
    leaq (%rsp), %rax
    movq %rax, 104(%rdi)
    movq %rbx, 96(%rdi)
    movq %rcx, 88(%rdi)
    movq %rdx, 80(%rdi)
    movq 0(%rax), %rax
    movq %rax, 72(%rdi)
    movq %rsi, 64(%rdi)
    movq %rdi, 56(%rdi)
    movq %rbp, 48(%rdi)
    movq %r8, 40(%rdi)
    movq %r9, 32(%rdi)
    movq %r12, 24(%rdi)
    movq %r13, 16(%rdi)
    movq %r14, 8(%rdi)
    movq %r15, 0(%rdi)
    xorq %rax, %rax

    movq 48(%rsi), %rbp
    movq 104(%rsi), %rsp
    movq 0(%rsi), %r15
    movq 8(%rsi), %r14
    movq 16(%rsi), %r13
    movq 24(%rsi), %r12
    movq 32(%rsi), %r9
    movq 40(%rsi), %r8
    movq 56(%rsi), %rdi
    movq 80(%rsi), %rdx
    movq 88(%rsi), %rcx
    movq 96(%rsi), %rbx
    leaq 8(%rsp), %rsp
    pushq 72(%rsi)
    movq 64(%rsi), %rsi
    ret
    .size coro_swap_registers, . - coro_swap_registers
    "#,
    options(att_syntax)
);

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
    .text
    .globl coro_swap_registers
    .type coro_swap_registers, @function
coro_swap_registers:
    leal 4(%esp), %eax
    movl 4(%esp), %esp
    leal 32(%esp), %esp

    pushl %eax
    pushl %ebp
    pushl %esi
    pushl %edi
    pushl %edx
    pushl %ecx
    pushl %ebx
    pushl -4(%eax)

    movl 4(%eax), %esp
    popl %eax
    popl %ebx
    popl %ecx
    popl %edx
    popl %edi
    popl %esi
    popl %ebp
    popl %esp
    pushl %eax

    xorl %eax, %eax
    ret
    .size coro_swap_registers, . - coro_swap_registers
    "#,
    options(att_syntax)
);

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
compile_error!("context switching is only implemented for x86 and x86_64");

#[cfg(test)]
mod test {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ENTERED: AtomicUsize = AtomicUsize::new(0);
    static mut MAIN_CTX: *mut Context = ptr::null_mut();
    static mut CORO_CTX: *mut Context = ptr::null_mut();

    extern "C" fn entry(arg: *mut c_void, tag: *mut c_void) {
        assert_eq!(arg as usize, 0x1234);
        assert!(tag.is_null());
        ENTERED.fetch_add(1, Ordering::SeqCst);
        unsafe {
            Context::swap(CORO_CTX, MAIN_CTX);
        }
        unreachable!();
    }

    #[test]
    fn test_swap_into_fresh_context_and_back() {
        const STACK_SIZE: usize = 64 * 1024;
        let layout = Layout::from_size_align(STACK_SIZE, 0x1000).unwrap();
        unsafe {
            let buf = alloc(layout);
            assert!(!buf.is_null());

            let mut main_ctx = Context::empty();
            let mut coro_ctx = Context::empty();
            coro_ctx.set_stack(buf, STACK_SIZE);
            coro_ctx.init(entry, 0x1234 as *mut c_void, ptr::null_mut());

            MAIN_CTX = &mut main_ctx;
            CORO_CTX = &mut coro_ctx;

            let before = ENTERED.load(Ordering::SeqCst);
            let marker: usize = 0xAABB;
            Context::swap(&mut main_ctx, &mut coro_ctx);
            assert_eq!(ENTERED.load(Ordering::SeqCst), before + 1);
            // locals survive the round trip
            assert_eq!(marker, 0xAABB);

            dealloc(buf, layout);
        }
    }
}
