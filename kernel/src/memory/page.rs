//! Supplemental page table entry: what a virtual page *would* contain if it
//! were resident, before the frame behind it exists. Mirrors the teacher's
//! `Vma`/`OpenFile` split of "what this region is" from "where it lives
//! right now" (see `memory::vma`), generalized to per-page granularity and
//! given the three kinds spec §3 calls for instead of one flat mmap region.

use super::frame::FrameId;
use super::swap::SwapSlot;
use alloc::sync::Arc;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::fs::vfs::file::OpenFile;

/// Where the bytes for a page come from when it is first faulted in, or
/// where they go when the frame behind it is evicted.
#[derive(Clone)]
pub enum PageKind {
    /// Never been resident. Zero-fill if there is no backing file, or the
    /// first `read_bytes` bytes of `file` at `file_offset` followed by
    /// zero-fill padding to the page boundary otherwise (spec §4.6's lazy
    /// ELF loading path reuses this for every PT_LOAD page).
    Uninit {
        file: Option<Arc<OpenFile>>,
        file_offset: u64,
        /// Byte offset within the page where the file's bytes begin; the
        /// bytes before it are zero-fill (spec §4.6's `page_offset`, needed
        /// when a segment's `p_vaddr` isn't itself page-aligned).
        page_offset: u64,
        read_bytes: u64,
        writable: bool,
    },
    /// Has been resident at least once. While resident, `swap_slot` is
    /// `None`; once evicted, the frame's contents live at `swap_slot` until
    /// the page is faulted back in.
    Anon { swap_slot: Option<SwapSlot> },
    /// Backed by a file-mapped region (the counterpart of the teacher's
    /// `vma::MmapFlags::SHARED`/`PRIVATE` split, here resolved per page
    /// rather than per region). Dirty private pages are never written back;
    /// dirty shared pages are.
    File {
        file: Arc<OpenFile>,
        file_offset: u64,
        length: u64,
        shared: bool,
    },
}

/// One entry in a process's supplemental page table: everything needed to
/// make a not-yet-resident (or no-longer-resident) page resident again.
pub struct PageDescriptor {
    pub va: VirtAddr,
    pub kind: PageKind,
    pub flags: PageTableFlags,
    /// Set once a frame has been claimed for this page; cleared again when
    /// the frame is evicted or the page is destroyed.
    pub frame: Option<FrameId>,
}

impl PageDescriptor {
    pub fn new_uninit(
        va: VirtAddr,
        flags: PageTableFlags,
        file: Option<Arc<OpenFile>>,
        file_offset: u64,
        page_offset: u64,
        read_bytes: u64,
        writable: bool,
    ) -> Self {
        Self {
            va,
            kind: PageKind::Uninit {
                file,
                file_offset,
                page_offset,
                read_bytes,
                writable,
            },
            flags,
            frame: None,
        }
    }

    pub fn new_anon(va: VirtAddr, flags: PageTableFlags) -> Self {
        Self {
            va,
            kind: PageKind::Anon { swap_slot: None },
            flags,
            frame: None,
        }
    }

    pub fn new_file(
        va: VirtAddr,
        flags: PageTableFlags,
        file: Arc<OpenFile>,
        file_offset: u64,
        length: u64,
        shared: bool,
    ) -> Self {
        Self {
            va,
            kind: PageKind::File {
                file,
                file_offset,
                length,
                shared,
            },
            flags,
            frame: None,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageTableFlags::WRITABLE)
    }

    /// Fill `dst` (one page, zero-initialized by the caller beforehand is
    /// not assumed here — this writes every byte it owns) with this page's
    /// initial contents. Called by `memory::fault::claim_page` right after
    /// a frame has been allocated for this descriptor.
    pub fn populate(&mut self, dst: &mut [u8]) -> Result<(), &'static str> {
        debug_assert_eq!(dst.len(), super::layout::PGSIZE as usize);
        match &self.kind {
            PageKind::Uninit {
                file,
                file_offset,
                page_offset,
                read_bytes,
                ..
            } => {
                dst.fill(0);
                if let Some(file) = file {
                    let start = (*page_offset).min(dst.len() as u64) as usize;
                    let n = (*read_bytes).min((dst.len() - start) as u64) as usize;
                    file.read_at(*file_offset, &mut dst[start..start + n])?;
                }
                // On first fault an Uninit page transitions permanently to
                // Anon: subsequent writebacks go to swap, never back to the
                // executable (spec §4.6 — text/data pages are never
                // written back to their backing ELF).
                self.kind = PageKind::Anon { swap_slot: None };
                Ok(())
            }
            PageKind::Anon { swap_slot } => match *swap_slot {
                Some(slot) => {
                    super::swap::read(slot, dst)?;
                    super::swap::free(slot);
                    // The slot is freed once read back in; a later eviction
                    // of this page allocates a fresh one (spec §4.3
                    // `Anon.swap_in`: "read it into `kva` and release the
                    // slot").
                    self.kind = PageKind::Anon { swap_slot: None };
                    Ok(())
                }
                None => {
                    dst.fill(0);
                    Ok(())
                }
            },
            PageKind::File {
                file,
                file_offset,
                length,
                ..
            } => {
                dst.fill(0);
                let n = (*length).min(dst.len() as u64) as usize;
                file.read_at(*file_offset, &mut dst[..n])
            }
        }
    }

    /// Write `src` (the frame's current contents) back to this page's
    /// backing store before the frame is reclaimed. Returns `Ok(())`
    /// without doing anything for kinds that never write back (private
    /// file mappings, still-first-touch Uninit) or, for `File`, when
    /// `dirty` is `false` (spec §4.3 `File.swap_out`: "if the owner's dirty
    /// bit is set for this VA, write `read_bytes` back ... clear dirty").
    /// `dirty` is the PTE dirty bit for this page's VA in its owner's page
    /// table, read by the caller before the mapping is torn down; this
    /// method has no page-table access of its own.
    pub fn writeback(&mut self, src: &[u8], dirty: bool) -> Result<(), &'static str> {
        debug_assert_eq!(src.len(), super::layout::PGSIZE as usize);
        match &mut self.kind {
            PageKind::Uninit { .. } => Ok(()),
            PageKind::Anon { swap_slot } => {
                let slot = match swap_slot {
                    Some(slot) => *slot,
                    None => {
                        let slot = super::swap::alloc_slot()?;
                        *swap_slot = Some(slot);
                        slot
                    }
                };
                super::swap::write(slot, src)
            }
            PageKind::File {
                file,
                file_offset,
                length,
                shared,
            } => {
                if *shared && dirty {
                    let n = (*length).min(src.len() as u64) as usize;
                    file.write_at(*file_offset, &src[..n])?;
                }
                Ok(())
            }
        }
    }

    /// Release whatever backing resource this descriptor owns (a swap slot)
    /// without writing anything back. Used when a process exits or a page
    /// is unmapped outright rather than evicted.
    pub fn destroy(&mut self) {
        if let PageKind::Anon { swap_slot } = &mut self.kind {
            if let Some(slot) = swap_slot.take() {
                super::swap::free(slot);
            }
        }
        self.frame = None;
    }

    /// Duplicate this descriptor for a forked child. Resident/backing state
    /// (frame assignment, swap slot) is intentionally NOT copied here: the
    /// caller is responsible for deep-copying resident frames separately
    /// (spec §4.3, "no COW optimization") and re-registering a fresh
    /// descriptor per page; this helper covers the non-resident kinds where
    /// simply sharing the backing description is correct (the file handle,
    /// or an as-yet-untouched Uninit page).
    pub fn fork_descriptor(&self) -> Self {
        let kind = match &self.kind {
            PageKind::Uninit {
                file,
                file_offset,
                page_offset,
                read_bytes,
                writable,
            } => PageKind::Uninit {
                file: file.clone(),
                file_offset: *file_offset,
                page_offset: *page_offset,
                read_bytes: *read_bytes,
                writable: *writable,
            },
            PageKind::Anon { .. } => PageKind::Anon { swap_slot: None },
            PageKind::File {
                file,
                file_offset,
                length,
                shared,
            } => PageKind::File {
                file: file.clone(),
                file_offset: *file_offset,
                length: *length,
                shared: *shared,
            },
        };
        Self {
            va: self.va,
            kind,
            flags: self.flags,
            frame: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vfs::file::{OpenFile, OpenFlags};
    use crate::fs::vfs::inode::{FilePermissions, FileType, VfsInode};

    fn test_file(data: alloc::vec::Vec<u8>) -> Arc<OpenFile> {
        let inode = VfsInode {
            inode_num: 1,
            file_type: FileType::Regular,
            size: data.len() as u64,
            permissions: FilePermissions::from_mode(0o644),
            uid: 0,
            gid: 0,
            link_count: 1,
            atime: 0,
            mtime: 0,
            ctime: 0,
        };
        Arc::new(OpenFile::new(inode, OpenFlags::from_flags(OpenFlags::O_RDWR), 0, data))
    }

    /// spec §4.3 `Anon.swap_in`: reading a recorded slot back in releases
    /// it, so the descriptor no longer references it.
    #[test]
    fn anon_swap_in_releases_the_slot() {
        let slot = super::super::swap::alloc_slot().unwrap();
        let page_size = super::super::layout::PGSIZE as usize;
        super::super::swap::write(slot, &alloc::vec![7u8; page_size]).unwrap();

        let mut desc = PageDescriptor {
            va: VirtAddr::new(0x1000),
            kind: PageKind::Anon { swap_slot: Some(slot) },
            flags: PageTableFlags::empty(),
            frame: None,
        };
        let mut dst = alloc::vec![0u8; page_size];
        desc.populate(&mut dst).unwrap();

        assert_eq!(dst, alloc::vec![7u8; page_size]);
        match desc.kind {
            PageKind::Anon { swap_slot: None } => {}
            _ => panic!("slot was not released after swap-in"),
        }
    }

    /// spec §4.3 `File.swap_out`: only write back when the owner's dirty
    /// bit is set for this VA.
    #[test]
    fn file_writeback_skips_when_not_dirty() {
        let page_size = super::super::layout::PGSIZE as usize;
        let file = test_file(alloc::vec![0u8; page_size]);
        let mut desc = PageDescriptor::new_file(
            VirtAddr::new(0x2000),
            PageTableFlags::empty(),
            file.clone(),
            0,
            page_size as u64,
            true,
        );

        let src = alloc::vec![9u8; page_size];
        desc.writeback(&src, false).unwrap();
        let mut readback = alloc::vec![0u8; page_size];
        file.read_at(0, &mut readback).unwrap();
        assert_eq!(readback, alloc::vec![0u8; page_size], "clean page must not be written back");

        desc.writeback(&src, true).unwrap();
        file.read_at(0, &mut readback).unwrap();
        assert_eq!(readback, src, "dirty page must be written back");
    }
}
