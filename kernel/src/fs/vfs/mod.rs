//! Virtual File System (VFS) Layer
//!
//! The narrow interface between the storage stack and the kernel's
//! namespace code:
//!
//! - Inode capability (`InodeOps`, `InodeAttr`, `DirEntry`)
//! - Filesystem instances (`FileSystem`, `StatFs`)
//! - Mount table (`MountTable`, `MountFlags`)
//!
//! # Architecture
//!
//! ```text
//! mount(2) / path walk (outside this crate)
//!         |
//!         v
//!     VFS Layer (this module)
//!         |
//!         v
//!     ext2 driver
//!         |
//!         v
//!     Page cache -> Block devices
//! ```

pub mod inode;
pub mod mount;

pub use inode::{DirEntry, DirStream, FileType, InodeAttr, InodeOps};
pub use mount::{FileSystem, MountFlags, MountInfo, MountTable, StatFs};
