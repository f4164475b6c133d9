//! Frame table: tracks which user page owns each physical frame claimed
//! through the supplemental page table, and picks an eviction victim by the
//! second-chance (clock) algorithm when the raw allocator in
//! `frame_allocator` runs dry. Layered the same way `kernel_page_table`
//! layers a higher-level policy on top of `process_memory`'s raw mapping
//! primitives: this module never pokes page tables directly, only frames.

use super::frame_allocator;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

/// Opaque identifier for a claimed frame; the index into the frame table's
/// insertion-ordered victim ring, not the physical address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(usize);

struct Entry {
    frame: PhysFrame,
    /// Owning process and the virtual address mapped to this frame, used to
    /// consult and clear the accessed bit through that process's page
    /// table, and to locate the supplemental-page-table descriptor to swap
    /// out when this frame is chosen as a victim.
    owner_pid: u64,
    owner_va: VirtAddr,
}

struct FrameTable {
    entries: Vec<Option<Entry>>,
    /// Clock hand for second-chance eviction.
    hand: usize,
}

static TABLE: Mutex<FrameTable> = Mutex::new(FrameTable {
    entries: Vec::new(),
    hand: 0,
});

/// What the evicting caller must do to make room: write the victim's page
/// back to its backing store (via the owning process's SPT) before its
/// frame can be reused.
pub struct Victim {
    pub id: FrameId,
    pub frame: PhysFrame,
    pub owner_pid: u64,
    pub owner_va: VirtAddr,
}

/// Claim a free physical frame and register it in the frame table under
/// `owner_pid`/`owner_va`. Falls back to evicting a victim when physical
/// memory is exhausted; the caller (`memory::fault::claim_page`) is
/// expected to have already written the victim back via `evict_prepare`
/// before calling this again, so the common path here is just "allocate".
pub fn claim(owner_pid: u64, owner_va: VirtAddr) -> Option<(FrameId, PhysFrame)> {
    let frame = frame_allocator::allocate_frame()?;
    let mut table = TABLE.lock();
    let entry = Entry {
        frame,
        owner_pid,
        owner_va,
    };
    for (i, slot) in table.entries.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(entry);
            return Some((FrameId(i), frame));
        }
    }
    let id = FrameId(table.entries.len());
    table.entries.push(Some(entry));
    Some((id, frame))
}

/// Look up the physical frame behind a previously claimed `FrameId`.
pub fn frame_of(id: FrameId) -> Option<PhysFrame> {
    let table = TABLE.lock();
    table.entries.get(id.0).and_then(|e| e.as_ref()).map(|e| e.frame)
}

/// Release a frame back to the raw allocator and clear its table entry.
/// Called once its owning descriptor has been destroyed (process exit,
/// explicit unmap) rather than evicted for reuse.
pub fn release(id: FrameId) {
    let mut table = TABLE.lock();
    if let Some(slot) = table.entries.get_mut(id.0) {
        if let Some(entry) = slot.take() {
            frame_allocator::deallocate_frame(entry.frame);
        }
    }
}

/// Pick an eviction victim with the second-chance algorithm: walk the
/// table starting at the clock hand, looking up each candidate's accessed
/// bit through `accessed` (supplied by the caller, since only
/// `memory::page_table` knows how to read a PTE for an arbitrary
/// process/VA pair). A set accessed bit is cleared and given a second
/// chance; the first frame found with a clear bit is returned.
pub fn pick_victim<F, C>(mut accessed: F, mut clear_accessed: C) -> Option<Victim>
where
    F: FnMut(u64, VirtAddr) -> bool,
    C: FnMut(u64, VirtAddr),
{
    let mut table = TABLE.lock();
    let len = table.entries.len();
    if len == 0 {
        return None;
    }
    for _ in 0..(2 * len) {
        let i = table.hand;
        table.hand = (table.hand + 1) % len;
        if let Some(entry) = &table.entries[i] {
            if accessed(entry.owner_pid, entry.owner_va) {
                clear_accessed(entry.owner_pid, entry.owner_va);
                continue;
            }
            return Some(Victim {
                id: FrameId(i),
                frame: entry.frame,
                owner_pid: entry.owner_pid,
                owner_va: entry.owner_va,
            });
        }
    }
    None
}

/// Re-home an existing frame table entry to a new owner/VA, after its
/// previous occupant has been evicted and the frame reused for a different
/// page (the common "evict victim, then claim for the faulting page" path
/// in `memory::fault::handle_page_fault`).
pub fn rehome(id: FrameId, owner_pid: u64, owner_va: VirtAddr) {
    let mut table = TABLE.lock();
    if let Some(Some(entry)) = table.entries.get_mut(id.0) {
        entry.owner_pid = owner_pid;
        entry.owner_va = owner_va;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn victim_selection_gives_accessed_pages_a_second_chance() {
        let mut table = TABLE.lock();
        table.entries.clear();
        table.hand = 0;
        table.entries.push(Some(Entry {
            frame: PhysFrame::containing_address(x86_64::PhysAddr::new(0x1000)),
            owner_pid: 1,
            owner_va: VirtAddr::new(0x1000),
        }));
        table.entries.push(Some(Entry {
            frame: PhysFrame::containing_address(x86_64::PhysAddr::new(0x2000)),
            owner_pid: 1,
            owner_va: VirtAddr::new(0x2000),
        }));
        drop(table);

        let mut accessed_calls: Vec<VirtAddr> = Vec::new();
        let victim = pick_victim(
            |_pid, va| {
                accessed_calls.push(va);
                va == VirtAddr::new(0x1000)
            },
            |_pid, _va| {},
        );
        assert_eq!(victim.unwrap().owner_va, VirtAddr::new(0x2000));

        let mut table = TABLE.lock();
        table.entries.clear();
        table.hand = 0;
    }
}
