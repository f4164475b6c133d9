//! Swap backend: a fixed-size block device standing in for disk swap space,
//! addressed in page-sized slots. Grounded on the teacher's `frame_allocator`
//! bitmap-over-a-flat-region design (`BootInfoFrameAllocator`/`FREE_FRAMES`):
//! same free-list-over-a-bitmap shape, applied to a backing `Vec<u8>` arena
//! instead of physical RAM, since this kernel has no disk driver to swap to.

use super::layout::PGSIZE;
use alloc::vec;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::Mutex;

/// Opaque handle to one page-sized region of swap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(usize);

const SWAP_SLOT_COUNT: usize = 2048; // 8 MiB of swap

struct SwapArena {
    storage: Vec<u8>,
    free: Vec<bool>,
}

static SWAP: OnceCell<Mutex<SwapArena>> = OnceCell::uninit();

fn arena() -> &'static Mutex<SwapArena> {
    SWAP.get_or_init(|| {
        Mutex::new(SwapArena {
            storage: vec![0u8; SWAP_SLOT_COUNT * PGSIZE as usize],
            free: vec![true; SWAP_SLOT_COUNT],
        })
    })
}

/// Reserve an unused slot. Errs if swap space is exhausted.
pub fn alloc_slot() -> Result<SwapSlot, &'static str> {
    let mut arena = arena().lock();
    let idx = arena
        .free
        .iter()
        .position(|&free| free)
        .ok_or("swap space exhausted")?;
    arena.free[idx] = false;
    Ok(SwapSlot(idx))
}

/// Release a slot back to the free list without touching its contents.
pub fn free(slot: SwapSlot) {
    let mut arena = arena().lock();
    arena.free[slot.0] = true;
}

/// Copy one page's worth of bytes out of `slot` into `dst`.
pub fn read(slot: SwapSlot, dst: &mut [u8]) -> Result<(), &'static str> {
    let arena = arena().lock();
    let start = slot.0 * PGSIZE as usize;
    let n = dst.len().min(PGSIZE as usize);
    dst[..n].copy_from_slice(&arena.storage[start..start + n]);
    Ok(())
}

/// Copy one page's worth of bytes from `src` into `slot`.
pub fn write(slot: SwapSlot, src: &[u8]) -> Result<(), &'static str> {
    let mut arena = arena().lock();
    let start = slot.0 * PGSIZE as usize;
    let n = src.len().min(PGSIZE as usize);
    arena.storage[start..start + n].copy_from_slice(&src[..n]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_round_trip_contents() {
        let slot = alloc_slot().unwrap();
        let page = vec![0x42u8; PGSIZE as usize];
        write(slot, &page).unwrap();
        let mut out = vec![0u8; PGSIZE as usize];
        read(slot, &mut out).unwrap();
        assert_eq!(out, page);
        free(slot);
    }

    #[test]
    fn freed_slot_is_reusable() {
        let slot = alloc_slot().unwrap();
        free(slot);
        let slot2 = alloc_slot().unwrap();
        assert_eq!(slot, slot2);
        free(slot2);
    }
}
