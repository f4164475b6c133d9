//! Opaque page-table-entry flag wrapper.
//!
//! The `x86_64` crate already treats individual page-table entries as opaque
//! (`PageTableEntry`/`PageTableFlags`); this module collects the flag
//! combinations the page-table manager cares about so callers never build
//! `PageTableFlags` bit patterns by hand at the call site.

use x86_64::structures::paging::PageTableFlags as Flags;

/// Flags for a present, user-accessible leaf entry.
#[inline]
pub fn user_leaf_flags(writable: bool) -> Flags {
    let mut flags = Flags::PRESENT | Flags::USER_ACCESSIBLE | Flags::NO_EXECUTE;
    if writable {
        flags |= Flags::WRITABLE;
    }
    flags
}

/// Flags for a present kernel-only leaf entry.
#[inline]
pub fn kernel_leaf_flags(writable: bool) -> Flags {
    let mut flags = Flags::PRESENT;
    if writable {
        flags |= Flags::WRITABLE;
    }
    flags
}

/// Flags for an intermediate (non-leaf) table entry. Intermediate entries
/// are always writable and user-accessible; the leaf entry's own flags are
/// what actually restrict access, matching how the `x86_64` crate's
/// `Mapper::map_to` expects parent tables to be configured.
#[inline]
pub fn intermediate_flags() -> Flags {
    Flags::PRESENT | Flags::WRITABLE | Flags::USER_ACCESSIBLE
}

/// Query helpers over a raw flags value, used when walking a table entry
/// without going through `Mapper`.
#[inline]
pub fn is_present(flags: Flags) -> bool {
    flags.contains(Flags::PRESENT)
}

#[inline]
pub fn is_writable(flags: Flags) -> bool {
    flags.contains(Flags::WRITABLE)
}

#[inline]
pub fn is_accessed(flags: Flags) -> bool {
    flags.contains(Flags::ACCESSED)
}

#[inline]
pub fn is_dirty(flags: Flags) -> bool {
    flags.contains(Flags::DIRTY)
}

/// Returns `flags` with the accessed bit cleared.
#[inline]
pub fn clear_accessed(flags: Flags) -> Flags {
    flags & !Flags::ACCESSED
}

/// Returns `flags` with the dirty bit cleared.
#[inline]
pub fn clear_dirty(flags: Flags) -> Flags {
    flags & !Flags::DIRTY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_leaf_flags_sets_user_and_no_execute() {
        let f = user_leaf_flags(true);
        assert!(f.contains(Flags::PRESENT));
        assert!(f.contains(Flags::USER_ACCESSIBLE));
        assert!(f.contains(Flags::WRITABLE));
        assert!(f.contains(Flags::NO_EXECUTE));
    }

    #[test]
    fn read_only_user_leaf_has_no_writable_bit() {
        let f = user_leaf_flags(false);
        assert!(!f.contains(Flags::WRITABLE));
    }

    #[test]
    fn clear_accessed_drops_only_accessed_bit() {
        let f = user_leaf_flags(true) | Flags::ACCESSED | Flags::DIRTY;
        let cleared = clear_accessed(f);
        assert!(!is_accessed(cleared));
        assert!(is_dirty(cleared));
        assert!(is_writable(cleared));
    }

    #[test]
    fn clear_dirty_drops_only_dirty_bit() {
        let f = user_leaf_flags(true) | Flags::ACCESSED | Flags::DIRTY;
        let cleared = clear_dirty(f);
        assert!(!is_dirty(cleared));
        assert!(is_accessed(cleared));
        assert!(is_writable(cleared));
    }
}
