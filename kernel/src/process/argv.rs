//! Argument marshalling onto the initial user stack (spec §4.6): split a
//! command line into argv tokens, push their bytes and a pointer array
//! following the System V calling convention an entry stub expects
//! (`rdi` = argc, `rsi` = &argv[0]), the same way the teacher's
//! `process_memory` module writes directly through the physical-memory
//! offset mapping rather than switching to the target address space first.

use crate::memory::layout::{PGSIZE, USER_STACK};
use crate::memory::process_memory::ProcessPageTable;
use alloc::string::String;
use alloc::vec::Vec;
use x86_64::VirtAddr;

pub struct StackSetup {
    pub rsp: u64,
    pub rdi: u64,
    pub rsi: u64,
}

/// Split a command line into whitespace-separated argv tokens.
pub fn split_args(command_line: &str) -> Vec<String> {
    command_line.split_whitespace().map(String::from).collect()
}

/// Write argv onto the single already-claimed top page of the user stack
/// and compute the rsp/rdi/rsi a trap frame should be initialized with.
/// Requires the page at `USER_STACK - PGSIZE` to already be mapped (set up
/// by `process::creation` before calling this).
pub fn setup(table: &ProcessPageTable, args: &[String]) -> Result<StackSetup, &'static str> {
    let page_va = VirtAddr::new(USER_STACK - PGSIZE);
    let phys = table
        .translate_page(page_va)
        .ok_or("argv: user stack page not mapped")?;
    let page_base = (crate::memory::physical_memory_offset() + phys.as_u64()).as_u64();

    let mut cursor = USER_STACK;
    let write = |cursor: &mut u64, bytes: &[u8]| -> Result<(), &'static str> {
        if *cursor < page_va.as_u64() + bytes.len() as u64 {
            return Err("argv too large for one stack page");
        }
        *cursor -= bytes.len() as u64;
        let dst = page_base + (*cursor - page_va.as_u64());
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len());
        }
        Ok(())
    };

    // Strings, rightmost argument first, each NUL-terminated; this leaves
    // argv[0]'s bytes at the lowest address among the strings.
    let mut argv_addrs = Vec::with_capacity(args.len());
    for arg in args.iter().rev() {
        write(&mut cursor, &[0u8])?;
        write(&mut cursor, arg.as_bytes())?;
        argv_addrs.push(cursor);
    }
    argv_addrs.reverse();

    // Align down to 8 bytes. The page was zero-filled on first claim, so
    // the padding bytes this skips over are already zero.
    cursor &= !0x7;

    write(&mut cursor, &0u64.to_le_bytes())?; // argv[argc] = NULL
    for &addr in argv_addrs.iter().rev() {
        write(&mut cursor, &addr.to_le_bytes())?;
    }
    let argv_base = cursor;
    write(&mut cursor, &0u64.to_le_bytes())?; // fake return address

    Ok(StackSetup {
        rsp: cursor,
        rdi: args.len() as u64,
        rsi: argv_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_tokenizes_on_whitespace() {
        let args = split_args("prog  arg1 arg2");
        assert_eq!(args, alloc::vec![String::from("prog"), String::from("arg1"), String::from("arg2")]);
    }

    #[test]
    fn split_args_handles_single_token() {
        assert_eq!(split_args("prog"), alloc::vec![String::from("prog")]);
    }
}
