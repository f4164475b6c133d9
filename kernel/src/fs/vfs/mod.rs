//! Virtual File System (VFS) Layer
//!
//! Provides a unified interface for filesystem operations, abstracting
//! the underlying filesystem implementation.
//!
//! - Abstract inode representation (`VfsInode`)
//! - Open file handles (`OpenFile`)
//! - Common error types (`VfsError`)

pub mod error;
pub mod file;
pub mod inode;

#[allow(unused_imports)]
pub use error::*;
#[allow(unused_imports)]
pub use file::*;
#[allow(unused_imports)]
pub use inode::*;
