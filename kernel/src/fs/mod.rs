//! Filesystem layer
//!
//! The VFS traits and mount table, and the read-only ext2 driver behind
//! them.

pub mod ext2;
pub mod vfs;
