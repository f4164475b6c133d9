//! Per-process supplemental page table (SPT): a hash table from virtual
//! page number to `PageDescriptor`, consulted by the page-fault handler for
//! every address that isn't already mapped. Hand-rolled open addressing
//! rather than `hashbrown::HashMap` since this workspace only carries the
//! dependencies the teacher's `Cargo.toml` already lists (spin,
//! conquer-once, log, linked_list_allocator, bootloader/x86_64/pic8259/
//! uart_16550) and none of those is a hash-map crate; this follows the same
//! "build the primitive you need directly" approach as `task::sync`'s
//! semaphore-backed `Lock`.

use super::page::PageDescriptor;
use alloc::vec::Vec;
use x86_64::VirtAddr;

/// FNV-1a, the same constant-multiply-and-xor hash the teacher would reach
/// for if `hashbrown` weren't available; good enough distribution for
/// page-aligned keys and trivial to implement with no crate.
fn fnv1a(key: u64) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for byte in key.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

enum Slot {
    Empty,
    Tombstone,
    Occupied(PageDescriptor),
}

/// A process's full set of not-necessarily-resident page descriptions,
/// keyed by page-aligned virtual address.
pub struct SupplementalPageTable {
    slots: Vec<Slot>,
    len: usize,
}

const INITIAL_CAPACITY: usize = 16;

impl SupplementalPageTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(INITIAL_CAPACITY);
        slots.resize_with(INITIAL_CAPACITY, || Slot::Empty);
        Self { slots, len: 0 }
    }

    fn page_key(va: VirtAddr) -> u64 {
        va.as_u64() & !(super::layout::PGSIZE - 1)
    }

    fn index_of(&self, key: u64) -> usize {
        (fnv1a(key) as usize) % self.slots.len()
    }

    /// Grow the backing table when the load factor crosses 1/2, same
    /// threshold `process_memory`'s neighboring tables use for their own
    /// bookkeeping growth.
    fn maybe_grow(&mut self) {
        if self.len * 2 < self.slots.len() {
            return;
        }
        let old = core::mem::replace(&mut self.slots, {
            let mut v = Vec::with_capacity(self.slots.len() * 2);
            v.resize_with(self.slots.len() * 2, || Slot::Empty);
            v
        });
        self.len = 0;
        for slot in old {
            if let Slot::Occupied(desc) = slot {
                self.insert_descriptor(desc);
            }
        }
    }

    fn insert_descriptor(&mut self, desc: PageDescriptor) {
        let key = Self::page_key(desc.va);
        let mut idx = self.index_of(key);
        loop {
            match &self.slots[idx] {
                Slot::Empty | Slot::Tombstone => {
                    self.slots[idx] = Slot::Occupied(desc);
                    self.len += 1;
                    return;
                }
                Slot::Occupied(_) => {
                    idx = (idx + 1) % self.slots.len();
                }
            }
        }
    }

    /// Register a new descriptor for `va`. Returns an error if a descriptor
    /// already exists there (callers must `remove` first to replace one).
    pub fn insert(&mut self, desc: PageDescriptor) -> Result<(), &'static str> {
        if self.find(desc.va).is_some() {
            return Err("page already has a supplemental table entry");
        }
        self.maybe_grow();
        self.insert_descriptor(desc);
        Ok(())
    }

    fn probe(&self, va: VirtAddr) -> Option<usize> {
        let key = Self::page_key(va);
        let mut idx = self.index_of(key);
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Occupied(desc) if Self::page_key(desc.va) == key => return Some(idx),
                _ => idx = (idx + 1) % self.slots.len(),
            }
        }
        None
    }

    pub fn find(&self, va: VirtAddr) -> Option<&PageDescriptor> {
        self.probe(va).map(|idx| match &self.slots[idx] {
            Slot::Occupied(desc) => desc,
            _ => unreachable!(),
        })
    }

    pub fn find_mut(&mut self, va: VirtAddr) -> Option<&mut PageDescriptor> {
        let idx = self.probe(va)?;
        match &mut self.slots[idx] {
            Slot::Occupied(desc) => Some(desc),
            _ => unreachable!(),
        }
    }

    /// Remove and return the descriptor at `va`, if any. Does not release
    /// the descriptor's backing resources; call `PageDescriptor::destroy`
    /// on the result if the caller isn't about to reinstall it elsewhere
    /// (e.g. fork's deep copy just clones and reinserts).
    pub fn remove(&mut self, va: VirtAddr) -> Option<PageDescriptor> {
        let idx = self.probe(va)?;
        match core::mem::replace(&mut self.slots[idx], Slot::Tombstone) {
            Slot::Occupied(desc) => {
                self.len -= 1;
                Some(desc)
            }
            _ => unreachable!(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(desc) => Some(desc),
            _ => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageDescriptor> {
        self.slots.iter_mut().filter_map(|s| match s {
            Slot::Occupied(desc) => Some(desc),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Release every descriptor's backing resources (swap slots) and empty
    /// the table. Called when a process exits (spec §4.6: destroying the
    /// SPT triggers writeback for resident dirty shared-file pages first —
    /// the caller is expected to have already written those back through
    /// the owning page table before calling this).
    pub fn destroy_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Slot::Occupied(mut desc) = core::mem::replace(slot, Slot::Empty) {
                desc.destroy();
            }
        }
        self.len = 0;
    }

    /// Build a deep copy of every descriptor for a forked child. Resident
    /// frames are copied separately by the caller
    /// (`process::fork::copy_user_pages`); this only duplicates the
    /// non-resident description (spec §4.3's "no COW optimization"
    /// requirement still applies to the metadata: the child gets its own
    /// independent descriptors, not shared ones).
    pub fn fork_copy(&self) -> Self {
        let mut copy = Self::new();
        for desc in self.iter() {
            copy.insert(desc.fork_descriptor())
                .expect("freshly built SPT copy cannot collide");
        }
        copy
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::structures::paging::PageTableFlags;

    #[test]
    fn insert_then_find_round_trips() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x4000_0000);
        spt.insert(PageDescriptor::new_anon(va, PageTableFlags::PRESENT))
            .unwrap();
        assert!(spt.find(va).is_some());
        assert!(spt.find(VirtAddr::new(0x5000_0000)).is_none());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x1000);
        spt.insert(PageDescriptor::new_anon(va, PageTableFlags::PRESENT))
            .unwrap();
        assert!(spt
            .insert(PageDescriptor::new_anon(va, PageTableFlags::PRESENT))
            .is_err());
    }

    #[test]
    fn remove_then_reinsert_succeeds() {
        let mut spt = SupplementalPageTable::new();
        let va = VirtAddr::new(0x2000);
        spt.insert(PageDescriptor::new_anon(va, PageTableFlags::PRESENT))
            .unwrap();
        assert!(spt.remove(va).is_some());
        assert!(spt.find(va).is_none());
        spt.insert(PageDescriptor::new_anon(va, PageTableFlags::PRESENT))
            .unwrap();
        assert!(spt.find(va).is_some());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut spt = SupplementalPageTable::new();
        for i in 0..64u64 {
            let va = VirtAddr::new(0x1000 * (i + 1));
            spt.insert(PageDescriptor::new_anon(va, PageTableFlags::PRESENT))
                .unwrap();
        }
        assert_eq!(spt.len(), 64);
        for i in 0..64u64 {
            let va = VirtAddr::new(0x1000 * (i + 1));
            assert!(spt.find(va).is_some());
        }
    }
}
