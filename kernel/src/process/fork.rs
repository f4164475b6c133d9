//! fork() memory and state duplication (spec §4.6). No CoW: every resident
//! page is copied immediately, the same way the teacher's
//! `copy_user_pages` walks the parent's page tables and allocates a fresh
//! frame per mapped page. Frames are claimed through `memory::frame` (not
//! allocated directly) so the child's copies are tracked for eviction and
//! exit teardown exactly like any other page; non-resident descriptors are
//! duplicated straight from the parent's supplemental page table.

use x86_64::structures::paging::{Page, PageTableFlags, Size4KiB};
use x86_64::VirtAddr;

use crate::memory::frame;
use crate::memory::process_memory::ProcessPageTable;
use crate::process::{Process, ProcessId};

/// Duplicate `parent`'s address space into `child`: non-resident
/// supplemental-page-table descriptors are deep-copied as-is, and every
/// currently-resident page gets a freshly claimed frame with its contents
/// copied in and a matching SPT entry recording the new frame. Returns the
/// number of resident pages copied.
pub fn fork_address_space(
    parent: &Process,
    child: &mut Process,
    child_id: ProcessId,
    parent_table: &ProcessPageTable,
    child_table: &mut ProcessPageTable,
) -> Result<usize, &'static str> {
    child.spt = parent.spt.fork_copy();

    let phys_offset = crate::memory::physical_memory_offset();
    let mut pages_copied = 0usize;
    let mut copy_error: Option<&'static str> = None;

    parent_table.walk_mapped_pages(|virt_addr, parent_phys, flags| {
        if copy_error.is_some() {
            return;
        }
        if !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
            return;
        }

        let (frame_id, child_frame) = match frame::claim(child_id.as_u64(), virt_addr) {
            Some(claimed) => claimed,
            None => {
                copy_error = Some("fork: out of memory copying parent pages");
                return;
            }
        };

        let parent_virt = phys_offset + parent_phys.as_u64();
        let child_virt = phys_offset + child_frame.start_address().as_u64();
        unsafe {
            core::ptr::copy_nonoverlapping(
                parent_virt.as_ptr::<u8>(),
                child_virt.as_mut_ptr::<u8>(),
                crate::memory::layout::PGSIZE as usize,
            );
        }

        let page = Page::<Size4KiB>::containing_address(virt_addr);
        if let Err(e) = child_table.map_page(page, child_frame, flags) {
            frame::release(frame_id);
            copy_error = Some(e);
            return;
        }

        if let Some(desc) = child.spt.find_mut(VirtAddr::new(virt_addr.as_u64())) {
            desc.frame = Some(frame_id);
        }
        pages_copied += 1;
    })?;

    if let Some(err) = copy_error {
        return Err(err);
    }

    log::debug!(
        "fork: copied {} resident pages from {} to {}",
        pages_copied,
        parent.id.as_u64(),
        child_id.as_u64()
    );
    Ok(pages_copied)
}

/// Copy non-memory process state a child inherits from its parent: the fd
/// table and the executable's write-deny. Each open fd is duplicated into
/// an independent `OpenFile` handle sharing the same backing inode (spec
/// §4.6: "each fd > stderr maps to an independent open-file handle sharing
/// the same inode; position is copied; write-deny is inherited"). The
/// child is a second process now running the same executable image, so it
/// takes its own deny-write reference on the shared inode counter rather
/// than merely holding a clone of the parent's — otherwise the parent
/// exiting first would re-permit writes while the child is still running.
pub fn copy_process_state(parent_process: &Process, child_process: &mut Process) {
    child_process.fd_table = parent_process
        .fd_table
        .iter()
        .map(|slot| slot.as_ref().map(|file| alloc::sync::Arc::new(file.clone_handle())))
        .collect();

    if let Some(executable) = &parent_process.executable {
        let child_handle = executable.clone_handle();
        child_handle.deny_write();
        child_process.executable = Some(alloc::sync::Arc::new(child_handle));
    }
}
