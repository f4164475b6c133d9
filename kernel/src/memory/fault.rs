//! Page-fault handler and the `claim_page` primitive (C4).
//!
//! `interrupts::page_fault_handler` is the out-of-scope IDT trampoline; this
//! module owns the actual policy, the same split `terminate_or_panic`
//! already draws between "kernel bug, panic" and "user fault, kill the
//! process". Returning `Err` here is reserved for the single genuine
//! kernel-bug case (a kernel-mode access to an unmapped kernel address);
//! every user-originated fault is resolved by returning `Ok(())` after
//! either demand-paging the access or terminating the process — never
//! both, so the IDT trampoline's panic path is only ever reached for a
//! real kernel defect.

use super::layout::{self, PGSIZE, USER_STACK, USER_STACK_LIMIT};
use super::page::PageDescriptor;
use super::page_table;
use super::pte;
use super::{frame, physical_memory_offset};
use crate::process::manager::ProcessManager;
use crate::process::{self, Process, ProcessId};
use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};
use x86_64::VirtAddr;

fn page_align_down(va: VirtAddr) -> VirtAddr {
    VirtAddr::new(va.as_u64() & !(PGSIZE - 1))
}

/// A claimed frame's contents, addressed through the kernel's direct
/// physical-memory mapping. Safe as long as no other code writes the same
/// frame concurrently, which holds here: frames are only ever touched
/// while the owning process's manager entry (and hence its SPT) is locked.
unsafe fn frame_bytes_mut(frame: x86_64::structures::paging::PhysFrame) -> &'static mut [u8] {
    let offset = physical_memory_offset();
    let virt = offset + frame.start_address().as_u64();
    core::slice::from_raw_parts_mut(virt.as_mut_ptr::<u8>(), PGSIZE as usize)
}

/// Evict one frame via the second-chance clock algorithm and return it to
/// the raw allocator, writing its contents back to their owning
/// descriptor's backing store first. Operates directly on an already-held
/// `&mut ProcessManager` rather than re-entering `with_process_manager`,
/// since the victim may belong to a different process than the one
/// currently claiming a frame and the manager lock is not reentrant.
fn evict_one(manager: &mut ProcessManager) -> Result<(), &'static str> {
    let victim = frame::pick_victim(
        |owner_pid, va| {
            manager
                .get(ProcessId::new(owner_pid))
                .and_then(|p| p.page_table.as_deref())
                .map_or(false, |t| page_table::is_accessed(t, va))
        },
        |owner_pid, va| {
            if let Some(table) = manager
                .get_mut(ProcessId::new(owner_pid))
                .and_then(|p| p.page_table.as_deref_mut())
            {
                page_table::clear_accessed(table, va);
            }
        },
    )
    .ok_or("no evictable frame")?;

    let owner = ProcessId::new(victim.owner_pid);
    let proc = manager.get_mut(owner).ok_or("victim process no longer exists")?;
    let table = proc.page_table.as_deref_mut().ok_or("victim has no page table")?;
    // spec §4.3 `File.swap_out`: write back only if this VA's dirty bit is
    // set, then clear it; read before the mapping below is torn down.
    let dirty = page_table::is_dirty(table, victim.owner_va);
    let contents = unsafe { frame_bytes_mut(victim.frame) };

    if let Some(desc) = proc.spt.find_mut(victim.owner_va) {
        desc.writeback(contents, dirty)?;
        desc.frame = None;
    }
    if dirty {
        page_table::clear_dirty(table, victim.owner_va);
    }
    let _ = page_table::unmap(table, victim.owner_va);
    frame::release(victim.id);
    Ok(())
}

/// `claim_page(va)` (spec §4.4): find the descriptor, obtain a frame from
/// C2 (evicting if necessary), dispatch the descriptor's fill routine, and
/// install the mapping via C1. Fails if no descriptor is registered at
/// `va`, or if the frame/mapping step fails.
pub fn claim_page(va: VirtAddr) -> Result<(), &'static str> {
    let pid = process::current_pid().ok_or("claim_page outside a process")?;
    process::with_process_manager(|manager| claim_in_manager(manager, pid, va))
        .ok_or("process manager unavailable")?
}

/// Same as `claim_page`, but operating on an already-held `&mut
/// ProcessManager`. Used by `process::manager`/`process::fork` when process
/// creation or forking is itself happening under the manager lock, where
/// calling `claim_page` (which re-locks) would deadlock.
pub(crate) fn claim_in_manager(
    manager: &mut ProcessManager,
    pid: ProcessId,
    va: VirtAddr,
) -> Result<(), &'static str> {
    let page_va = page_align_down(va);

    let writable = manager
        .get(pid)
        .and_then(|p| p.spt.find(page_va))
        .ok_or("claim_page: no supplemental descriptor")?
        .is_writable();

    let claimed = match frame::claim(pid.as_u64(), page_va) {
        Some(c) => c,
        None => {
            evict_one(manager)?;
            frame::claim(pid.as_u64(), page_va).ok_or("out of memory")?
        }
    };
    let (frame_id, phys_frame) = claimed;

    let result = (|| -> Result<(), &'static str> {
        let proc = manager.get_mut(pid).ok_or("process disappeared during claim")?;
        let dst = unsafe { frame_bytes_mut(phys_frame) };
        let desc = proc
            .spt
            .find_mut(page_va)
            .ok_or("claim_page: descriptor vanished")?;
        desc.populate(dst)?;
        desc.frame = Some(frame_id);

        let flags = pte::user_leaf_flags(writable);
        let table = proc.page_table.as_deref_mut().ok_or("process has no page table")?;
        page_table::map(table, page_va, phys_frame, flags)
    })();

    if result.is_err() {
        frame::release(frame_id);
    }
    result
}

/// Write a resident descriptor's frame back to its backing store (if any)
/// and release the frame. Used by exit teardown (spec §4.6: destroying the
/// SPT triggers kind-specific writeback) and is the same writeback step
/// eviction performs, just without needing a victim selection first.
/// `dirty` is the PTE dirty bit for this page, read by the caller from the
/// process's still-live page table before it tears the mapping down.
pub fn writeback_and_release(desc: &mut PageDescriptor, dirty: bool) {
    if let Some(frame_id) = desc.frame {
        if let Some(phys_frame) = frame::frame_of(frame_id) {
            let contents = unsafe { frame_bytes_mut(phys_frame) };
            let _ = desc.writeback(contents, dirty);
        }
        frame::release(frame_id);
        desc.frame = None;
    }
}

fn saved_user_rsp() -> Option<u64> {
    let tid = crate::task::scheduler::current_thread_id()?;
    crate::task::scheduler::with_thread_mut(tid, |t| {
        t.saved_userspace_context.as_ref().map(|c| c.rsp)
    })
    .flatten()
}

/// spec §4.4 step 4: within 8 bytes below the saved user rsp (to admit the
/// `push`-before-fault case) and within the configured maximum stack size
/// below `USER_STACK`.
fn is_stack_growth_candidate(faulting_address: u64, saved_rsp: u64) -> bool {
    faulting_address + 8 >= saved_rsp
        && faulting_address < USER_STACK
        && faulting_address >= USER_STACK - USER_STACK_LIMIT
}

fn grow_stack(pid: ProcessId, page_va: VirtAddr) -> Result<(), &'static str> {
    process::with_process_manager(|manager| -> Result<(), &'static str> {
        let proc = manager.get_mut(pid).ok_or("process disappeared during stack growth")?;
        proc.spt
            .insert(PageDescriptor::new_anon(page_va, pte::user_leaf_flags(true)))
    })
    .ok_or("process manager unavailable")??;
    claim_page(page_va)
}

fn terminate_current() {
    process::exit_current(-1);
    crate::task::scheduler::set_need_resched();
}

fn has_descriptor(pid: ProcessId, page_va: VirtAddr) -> bool {
    process::with_process_manager(|manager| {
        manager.get(pid).map_or(false, |p: &Process| p.spt.find(page_va).is_some())
    })
    .unwrap_or(false)
}

/// Top-level dispatcher called from the IDT's `page_fault_handler`.
pub fn handle_page_fault(
    faulting_address: VirtAddr,
    error_code: PageFaultErrorCode,
    stack_frame: &InterruptStackFrame,
) -> Result<(), &'static str> {
    let from_user = (stack_frame.code_segment.0 & 3) == 3;
    let is_kernel_half = layout::is_kernel_address(faulting_address.as_u64());

    if is_kernel_half {
        if from_user {
            terminate_current();
            return Ok(());
        }
        // A kernel-mode access to an unmapped kernel address is not
        // recoverable by this core's fault handler; the IDT trampoline's
        // `terminate_or_panic` is the right place to stop.
        return Err("kernel-mode fault at unmapped kernel address");
    }

    let pid = match process::current_pid() {
        Some(pid) => pid,
        None => return Err("page fault with no current process"),
    };

    let page_va = page_align_down(faulting_address);
    let not_present = !error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);

    if not_present && has_descriptor(pid, page_va) {
        if claim_page(page_va).is_err() {
            terminate_current();
        }
        return Ok(());
    }

    let candidate = saved_user_rsp().map_or(false, |rsp| {
        is_stack_growth_candidate(faulting_address.as_u64(), rsp)
    });
    if not_present && candidate {
        if grow_stack(pid, page_va).is_err() {
            terminate_current();
        }
        return Ok(());
    }

    terminate_current();
    Ok(())
}

/// Helper used by `process::creation`/`process::fork` to eagerly back a
/// freshly registered page (the initial user stack page, in particular)
/// rather than waiting for a fault.
pub fn claim_now(va: VirtAddr) -> Result<(), &'static str> {
    claim_page(va)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_growth_window_matches_spec_bounds() {
        let rsp = USER_STACK - 64;
        assert!(is_stack_growth_candidate(rsp - 8, rsp));
        assert!(!is_stack_growth_candidate(rsp - 9, rsp));
        assert!(!is_stack_growth_candidate(USER_STACK, rsp));
        assert!(!is_stack_growth_candidate(USER_STACK - USER_STACK_LIMIT - 1, rsp));
    }

    #[test]
    fn page_align_down_clears_low_bits() {
        let va = VirtAddr::new(0x1000 + 0x123);
        assert_eq!(page_align_down(va).as_u64(), 0x1000);
    }
}
