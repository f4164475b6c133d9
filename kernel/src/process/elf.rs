//! Lazy ELF64 loader (spec §4.6): validate the header, then for every
//! `PT_LOAD` program header register one `Uninit` supplemental-page-table
//! descriptor per page instead of reading the segment in eagerly. The
//! header/program-header layouts are the teacher's own (`crate::elf`); what
//! changes is that loading a segment means `spt.insert(..)`, not
//! `map_page` + a synchronous `read`.

use core::mem;

use alloc::sync::Arc;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::elf::{Elf64Header, Elf64ProgramHeader, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC};
use crate::fs::vfs::file::OpenFile;
use crate::memory::layout::{page_round_down, page_round_up, PGSIZE};
use crate::memory::page::PageDescriptor;
use crate::memory::supplemental_page_table::SupplementalPageTable;

const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3e;
const PT_NULL: u32 = 0;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_NOTE: u32 = 4;
const PT_SHLIB: u32 = 5;
const PT_PHDR: u32 = 6;
const PT_STACK: u32 = 0x6474e551;

pub struct LoadedImage {
    pub entry_point: VirtAddr,
    /// Page-aligned end of the highest loaded segment; start of the heap.
    pub segments_end: u64,
}

/// Validate `executable`'s contents as an ELF64 executable and register a
/// lazy descriptor for every page of every `PT_LOAD` segment into `spt`.
/// Aborts (without partially registering later segments) on any segment
/// type this core does not support.
pub fn load(
    executable: &Arc<OpenFile>,
    data: &[u8],
    spt: &mut SupplementalPageTable,
) -> Result<LoadedImage, &'static str> {
    if data.len() < mem::size_of::<Elf64Header>() {
        return Err("elf: file too small for header");
    }
    let mut header_bytes = [0u8; mem::size_of::<Elf64Header>()];
    header_bytes.copy_from_slice(&data[..mem::size_of::<Elf64Header>()]);
    let header: &Elf64Header = unsafe { &*(header_bytes.as_ptr() as *const Elf64Header) };

    if header.magic != ELF_MAGIC {
        return Err("elf: bad magic");
    }
    if header.class != ELFCLASS64 {
        return Err("elf: not 64-bit");
    }
    if header.data != ELFDATA2LSB {
        return Err("elf: not little-endian");
    }
    if header.version != 1 {
        return Err("elf: bad version");
    }
    if header.elf_type != ET_EXEC {
        return Err("elf: not an executable");
    }
    if header.machine != EM_X86_64 {
        return Err("elf: not amd64");
    }
    if header.phentsize as usize != mem::size_of::<Elf64ProgramHeader>() {
        return Err("elf: unexpected phentsize");
    }
    if header.phnum > 1024 {
        return Err("elf: too many program headers");
    }

    let ph_offset = header.phoff as usize;
    let ph_size = header.phentsize as usize;
    let ph_count = header.phnum as usize;
    let mut segments_end = 0u64;

    for i in 0..ph_count {
        let ph_start = ph_offset + i * ph_size;
        if ph_start + ph_size > data.len() {
            return Err("elf: program header out of bounds");
        }
        let mut ph_bytes = [0u8; mem::size_of::<Elf64ProgramHeader>()];
        ph_bytes.copy_from_slice(&data[ph_start..ph_start + ph_size]);
        let ph: &Elf64ProgramHeader = unsafe { &*(ph_bytes.as_ptr() as *const Elf64ProgramHeader) };

        match ph.p_type {
            PT_NULL | PT_NOTE | PT_PHDR | PT_STACK => continue,
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => {
                return Err("elf: dynamic linking is not supported");
            }
            PT_LOAD => {
                let end = register_segment(executable, ph, spt)?;
                if end > segments_end {
                    segments_end = end;
                }
            }
            _ => continue,
        }
    }

    Ok(LoadedImage {
        entry_point: VirtAddr::new(header.entry),
        segments_end: page_round_up(segments_end),
    })
}

/// Register one `Uninit` descriptor per page of a `PT_LOAD` segment so that
/// `read_bytes + zero_bytes == PGSIZE` for every page, per the spec's
/// splitting rule. Returns the (unaligned) end virtual address covered.
fn register_segment(
    executable: &Arc<OpenFile>,
    ph: &Elf64ProgramHeader,
    spt: &mut SupplementalPageTable,
) -> Result<u64, &'static str> {
    if ph.p_filesz > ph.p_memsz {
        return Err("elf: filesz exceeds memsz");
    }

    let writable = ph.p_flags & 0x2 != 0;
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }

    let seg_start = ph.p_vaddr;
    let seg_file_start = ph.p_offset;
    let page_start = page_round_down(seg_start);
    let page_end = page_round_up(seg_start + ph.p_memsz);

    let mut page_va = page_start;
    while page_va < page_end {
        // Offset of this page's first byte relative to the segment start;
        // can be negative relative to the file if the segment's vaddr
        // isn't page-aligned, in which case the leading bytes are zero.
        let page_offset_in_seg = page_va as i64 - seg_start as i64;

        let (file_offset, in_page_offset, read_bytes) = if page_offset_in_seg < 0 {
            let lead_zero = (-page_offset_in_seg) as u64;
            let remaining_file = ph.p_filesz;
            let avail = PGSIZE.saturating_sub(lead_zero);
            (seg_file_start, lead_zero, remaining_file.min(avail))
        } else {
            let off_in_seg = page_offset_in_seg as u64;
            if off_in_seg >= ph.p_filesz {
                (seg_file_start + off_in_seg, 0, 0)
            } else {
                let remaining_file = ph.p_filesz - off_in_seg;
                (seg_file_start + off_in_seg, 0, remaining_file.min(PGSIZE))
            }
        };

        let descriptor = PageDescriptor::new_uninit(
            VirtAddr::new(page_va),
            flags,
            Some(executable.clone()),
            file_offset,
            in_page_offset,
            read_bytes,
            writable,
        );
        // A later LOAD segment may legitimately re-touch a page another
        // segment's tail already registered (sub-page alignment overlap);
        // keep whichever was registered first rather than erroring.
        if spt.find(VirtAddr::new(page_va)).is_none() {
            spt.insert(descriptor)?;
        }

        page_va += PGSIZE;
    }

    Ok(seg_start + ph.p_memsz)
}
