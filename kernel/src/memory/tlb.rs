//! Translation Lookaside Buffer invalidation (part of C1, the page-table
//! manager).
//!
//! `unmap`/`map` on a process's own table only need a flush when that
//! table is the one currently active in CR3 — flushing a page in an
//! inactive address space is a no-op at best and a spurious stall at
//! worst, so every helper here takes the map's root frame and compares it
//! against the live CR3 before touching hardware.

use x86_64::registers::control::Cr3;
use x86_64::structures::paging::{Page, PhysFrame, Size4KiB};
use x86_64::{instructions::tlb, VirtAddr};

/// True if `root` is the physical frame currently loaded in CR3.
pub fn is_active(root: PhysFrame) -> bool {
    Cr3::read().0 == root
}

/// Invalidate the single page-table entry for `va`, if `root` is active.
pub fn flush_page(root: PhysFrame, va: VirtAddr) {
    if is_active(root) {
        tlb::flush(va);
    }
}

/// Invalidate a single 4 KiB page by `Page` value.
pub fn flush(root: PhysFrame, page: Page<Size4KiB>) {
    flush_page(root, page.start_address());
}

/// Invalidate the entire TLB by reloading CR3, if `root` is active.
/// Used after bulk operations (address-space destroy, fork's deep SPT
/// copy) where per-page flushes would cost more than one full reload.
pub fn flush_all(root: PhysFrame) {
    if is_active(root) {
        tlb::flush_all();
    }
}
