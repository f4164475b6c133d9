//! Spec-shaped page table operations: walk/map/unmap/query/set/activate,
//! delegated to `process_memory::ProcessPageTable`. That type already owns
//! the real 4-level-paging machinery (address space creation, kernel-half
//! deep copy, `OffsetPageTable`-backed map/unmap); this module just gives
//! C3/C4 a narrow, named surface to call instead of reaching into its
//! debug-instrumented internals directly.

use super::process_memory::ProcessPageTable;
use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

pub use super::process_memory::{switch_to_kernel_page_table, switch_to_process_page_table};

/// Map `va` to `frame` with `flags` in `table`. Used by `claim_page` once a
/// frame has been populated for a supplemental-page-table entry.
pub fn map(
    table: &mut ProcessPageTable,
    va: VirtAddr,
    frame: PhysFrame<Size4KiB>,
    flags: PageTableFlags,
) -> Result<(), &'static str> {
    let page = Page::<Size4KiB>::containing_address(va);
    table.map_page(page, frame, flags)
}

/// Remove whatever mapping exists at `va`, returning the frame it pointed
/// at. Used when evicting a resident page back to its supplemental
/// descriptor or tearing down an address space.
pub fn unmap(table: &mut ProcessPageTable, va: VirtAddr) -> Result<PhysFrame<Size4KiB>, &'static str> {
    let page = Page::<Size4KiB>::containing_address(va);
    table.unmap_page(page)
}

/// Look up the frame and raw entry flags backing `va`, if mapped.
pub fn query(table: &ProcessPageTable, va: VirtAddr) -> Option<(PhysFrame<Size4KiB>, PageTableFlags)> {
    let page = Page::<Size4KiB>::containing_address(va);
    table.get_page_info(page)
}

pub fn is_present(table: &ProcessPageTable, va: VirtAddr) -> bool {
    query(table, va).is_some()
}

pub fn is_accessed(table: &ProcessPageTable, va: VirtAddr) -> bool {
    query(table, va).map_or(false, |(_, flags)| super::pte::is_accessed(flags))
}

pub fn is_dirty(table: &ProcessPageTable, va: VirtAddr) -> bool {
    query(table, va).map_or(false, |(_, flags)| super::pte::is_dirty(flags))
}

/// Clear the accessed bit on the entry at `va`, leaving everything else
/// unchanged. Used by the clock algorithm's "give a second chance" step.
pub fn clear_accessed(table: &mut ProcessPageTable, va: VirtAddr) {
    if let Some((_, flags)) = query(table, va) {
        let page = Page::<Size4KiB>::containing_address(va);
        let _ = table.update_page_flags(page, super::pte::clear_accessed(flags));
    }
}

/// Clear the dirty bit on the entry at `va`, leaving everything else
/// unchanged. Used after a dirty `File` page has been written back on
/// eviction/unmap (spec §4.3 `File.swap_out`: "clear dirty").
pub fn clear_dirty(table: &mut ProcessPageTable, va: VirtAddr) {
    if let Some((_, flags)) = query(table, va) {
        let page = Page::<Size4KiB>::containing_address(va);
        let _ = table.update_page_flags(page, super::pte::clear_dirty(flags));
    }
}

/// Update the flags of an already-mapped page without changing its frame.
pub fn set_flags(
    table: &mut ProcessPageTable,
    va: VirtAddr,
    flags: PageTableFlags,
) -> Result<(), &'static str> {
    let page = Page::<Size4KiB>::containing_address(va);
    table.update_page_flags(page, flags)
}
