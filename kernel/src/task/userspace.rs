//! Ring 0 -> Ring 3 entry (spec §4.5/§4.6: a user thread's first dispatch).
//!
//! `task::context`'s `switch_context`/`switch_to_thread` only ever move
//! between kernel-mode contexts: they save/restore GP registers and RFLAGS
//! but never touch CS/SS, so they cannot by themselves drop a thread into
//! Ring 3. A user thread's `Thread::context` therefore still describes a
//! Ring 0 frame whose `rip` points at `user_thread_start` below; the first
//! (and every subsequent resume after a syscall/fault round-trip) actual
//! transition to the user binary's own registers happens here, driven by
//! the `CpuContext` parked in `saved_userspace_context`.

use super::thread::CpuContext;
use core::arch::global_asm;

global_asm!(r#"
.global enter_userspace

// enter_userspace(ctx: *const CpuContext) -> !
// RDI = pointer to a Ring-3 CpuContext (ss, rsp, rflags, cs, rip, then the
// 16 general-purpose registers, laid out exactly as task::thread::CpuContext).
// Builds the iretq frame by hand, since control did not arrive here via an
// actual interrupt, then loads every GP register and drops to Ring 3.
enter_userspace:
    mov rax, [rdi + 0x98]    // ss
    push rax
    mov rax, [rdi + 0x38]    // rsp
    push rax
    mov rax, [rdi + 0x88]    // rflags
    push rax
    mov rax, [rdi + 0x90]    // cs
    push rax
    mov rax, [rdi + 0x80]    // rip
    push rax

    mov rbx, [rdi + 0x08]
    mov rcx, [rdi + 0x10]
    mov rdx, [rdi + 0x18]
    mov rsi, [rdi + 0x20]
    mov rbp, [rdi + 0x30]
    mov r8,  [rdi + 0x40]
    mov r9,  [rdi + 0x48]
    mov r10, [rdi + 0x50]
    mov r11, [rdi + 0x58]
    mov r12, [rdi + 0x60]
    mov r13, [rdi + 0x68]
    mov r14, [rdi + 0x70]
    mov r15, [rdi + 0x78]

    mov rax, [rdi + 0x00]
    mov rdi, [rdi + 0x28]    // load RDI last, it's also our base pointer

    iretq
"#);

extern "C" {
    fn enter_userspace(ctx: *const CpuContext) -> !;
}

/// Entry point every user thread's kernel-mode `CpuContext` points its
/// `rip` at. Runs once, in Ring 0, on the thread's own kernel stack; reads
/// back the Ring-3 context the process manager parked in
/// `saved_userspace_context` and transitions.
pub extern "C" fn user_thread_start() -> ! {
    let tid = super::scheduler::current_thread_id().expect("user_thread_start with no current thread");
    let ctx = super::scheduler::with_thread_mut(tid, |t| {
        t.saved_userspace_context
            .clone()
            .expect("user thread has no saved userspace context")
    })
    .expect("user_thread_start: current thread vanished");

    // Safety: ctx was built by process::manager/fork with selectors from
    // gdt's user code/data descriptors and a stack the loader/argv setup
    // has already mapped, matching what iretq requires to drop to Ring 3.
    unsafe { enter_userspace(&ctx) }
}
