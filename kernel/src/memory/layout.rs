//! Canonical kernel memory layout constants.
//!
//! Defines the split between the kernel half and the user half of the
//! 48-bit canonical address space, plus the fixed top-of-stack address
//! every user process starts from.

use x86_64::VirtAddr;

/// Identity-mapped physical memory offset base the bootloader gives us.
/// Populated by `memory::init`; used to translate physical addresses to
/// the kernel's direct map.
pub const HHDM_BASE: u64 = 0xffff_8000_0000_0000;

/// PML4 index at which the kernel half begins. Every PML4 entry at or
/// above this index is part of the shared kernel mapping and is copied
/// (not allocated) into every new process address space.
pub const KERNEL_PML4_START: usize = 256;

/// Base of the user half of the address space (VA 0, lower canonical range).
pub const USERSPACE_BASE: u64 = 0x0000_0000_0040_0000;

/// End of the user code/data region; ELF segments are loaded below this.
pub const USERSPACE_CODE_DATA_END: u64 = 0x0000_7000_0000_0000;

/// Fixed top-of-stack virtual address for every user process. The first
/// stack page is `USER_STACK - PGSIZE`, and the stack grows down from here.
pub const USER_STACK: u64 = 0x0000_7FFF_FFFF_F000;

/// Maximum size the user stack may grow to via stack-growth faults (8 MiB).
pub const USER_STACK_LIMIT: u64 = 8 * 1024 * 1024;

/// Page size on x86-64 with 4 KiB pages.
pub const PGSIZE: u64 = 4096;

/// Base virtual address for kernel stacks handed out to newly created
/// threads. Each thread's kernel stack occupies one `KERNEL_STACK_SIZE`
/// slot, separated by an unmapped guard page.
pub const KERNEL_STACK_REGION_BASE: u64 = 0xffff_c900_0000_0000;

/// Size of a single thread's kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Guard gap between adjacent kernel stacks.
pub const KERNEL_STACK_GUARD_SIZE: usize = PGSIZE as usize;

/// Stride between kernel stack slots (stack + guard, page-rounded).
pub const KERNEL_STACK_STRIDE: usize = KERNEL_STACK_SIZE + KERNEL_STACK_GUARD_SIZE;

/// Round `addr` down to the start of its containing page.
#[inline]
pub fn page_round_down(addr: u64) -> u64 {
    addr & !(PGSIZE - 1)
}

/// Round `addr` up to the start of the next page (no-op if already aligned).
#[inline]
pub fn page_round_up(addr: u64) -> u64 {
    page_round_down(addr + PGSIZE - 1)
}

/// True if `addr` is aligned to a page boundary.
#[inline]
pub fn is_page_aligned(addr: u64) -> bool {
    addr & (PGSIZE - 1) == 0
}

/// True if `addr` lies in the kernel half of the address space.
#[inline]
pub fn is_kernel_address(addr: u64) -> bool {
    let pml4_index = (addr >> 39) & 0x1ff;
    pml4_index as usize >= KERNEL_PML4_START
}

/// Virtual address of the Nth kernel-stack slot (0-based).
pub fn kernel_stack_slot(slot: usize) -> VirtAddr {
    let base = KERNEL_STACK_REGION_BASE + (slot * KERNEL_STACK_STRIDE) as u64;
    VirtAddr::new(base)
}

const _: () = assert!(USERSPACE_CODE_DATA_END < USER_STACK - USER_STACK_LIMIT);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_round_down(0x1fff), 0x1000);
        assert_eq!(page_round_down(0x2000), 0x2000);
        assert_eq!(page_round_up(0x1001), 0x2000);
        assert_eq!(page_round_up(0x2000), 0x2000);
    }

    #[test]
    fn alignment_check() {
        assert!(is_page_aligned(0x1000));
        assert!(!is_page_aligned(0x1001));
    }

    #[test]
    fn kernel_half_detection() {
        assert!(!is_kernel_address(USERSPACE_BASE));
        assert!(is_kernel_address(HHDM_BASE));
        assert!(is_kernel_address(0xffff_ffff_8000_0000));
    }

    #[test]
    fn kernel_stack_slots_are_distinct_and_strided() {
        let a = kernel_stack_slot(0);
        let b = kernel_stack_slot(1);
        assert_eq!(b.as_u64() - a.as_u64(), KERNEL_STACK_STRIDE as u64);
    }
}
