//! Glue between scheduling decisions (`task::scheduler`) and the actual
//! register-level switch (`task::context`). Kept separate so a decision
//! ("who runs next") never needs to know how a switch is carried out,
//! matching how `task::scheduler` is written to be mechanism-agnostic.

use crate::process;
use crate::task::{context, scheduler};
use crate::task::thread::CpuContext;

/// Ask the scheduler for a decision and, if a different thread is due,
/// activate the incoming thread's address space and kernel stack (spec
/// §4.5: every thread switch is also a potential process switch) and
/// perform the register-level switch. Called from `yield_current`,
/// blocking-primitive wakeups, and interrupt return.
pub fn reschedule() {
    x86_64::instructions::interrupts::without_interrupts(|| {
        let Some((old_id, new_id)) = scheduler::schedule() else {
            return;
        };
        if old_id == new_id {
            return;
        }

        activate_incoming_process(new_id);

        let old_ctx = scheduler::with_thread_mut(old_id, |t| &mut t.context as *mut CpuContext);
        let new_ctx = scheduler::with_thread_mut(new_id, |t| &t.context as *const CpuContext);
        let (old_ctx, new_ctx) = match (old_ctx, new_ctx) {
            (Some(o), Some(n)) => (o, n),
            _ => return,
        };

        log::trace!("context switch: thread {} -> {}", old_id, new_id);

        // Safety: both threads are registered in the scheduler's thread
        // table and kept alive by it for the duration of this switch.
        // Interrupts stay disabled for the whole call so nothing else
        // touches either Thread's context field concurrently.
        unsafe {
            context::perform_context_switch(&mut *old_ctx, &*new_ctx);
        }
    });
}

/// Switch CR3 to `new_id`'s owning process's page table and point the
/// TSS's RSP0 at its kernel stack, so a syscall/interrupt taken while it
/// runs lands on the right stack. A thread with no owning process (the
/// idle thread, or any purely kernel thread) leaves the address space and
/// RSP0 untouched.
fn activate_incoming_process(new_id: u64) {
    let Some(pid) = process::with_process_manager(|m| m.process_for_thread(new_id)).flatten() else {
        return;
    };
    process::with_process_manager(|m| {
        if let Some(proc) = m.get(pid) {
            if let Some(table) = proc.page_table.as_deref() {
                unsafe { crate::memory::process_memory::switch_to_process_page_table(table) };
            }
            if let Some(kernel_stack_top) = proc.main_thread.as_ref().and_then(|t| t.kernel_stack_top) {
                crate::gdt::set_kernel_stack(kernel_stack_top);
            }
        }
    });
}

/// Idle thread entry point: disable interrupts, confirm nothing is ready,
/// then halt until the next interrupt wakes the CPU (spec's idle-thread
/// contract). Runs forever as the idle thread's body.
pub extern "C" fn idle_loop(_arg: u64) -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        if scheduler::with_scheduler(|s| s.has_runnable_threads()).unwrap_or(false) {
            x86_64::instructions::interrupts::enable();
            reschedule();
            continue;
        }
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}
