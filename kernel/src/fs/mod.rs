//! Filesystem abstraction layer.
//!
//! This core has no block-device driver or on-disk filesystem (both are
//! named out-of-scope collaborators); what remains is the VFS-level
//! `OpenFile`/`VfsInode` abstraction the process lifecycle and
//! file-backed supplemental pages are built on, with program images and
//! other backing data held directly in kernel memory.

pub mod vfs;
