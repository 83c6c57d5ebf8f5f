//! VFS Inode Abstraction
//!
//! [`InodeOps`] is the capability a filesystem hands to the (external)
//! namespace layer: reads, lookups, directory listing and attributes, plus
//! a write family. Every filesystem in this tree is read-only, so the write
//! family has a default that fails with `EROFS`.

use crate::error::{Errno, KResult};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;

/// File type (matches POSIX conventions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    SymLink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// Decode the `S_IFMT` bits of a mode
    pub fn from_mode(mode: u16) -> Option<Self> {
        Some(match mode & 0xF000 {
            0x8000 => FileType::Regular,
            0x4000 => FileType::Directory,
            0xA000 => FileType::SymLink,
            0x2000 => FileType::CharDevice,
            0x6000 => FileType::BlockDevice,
            0x1000 => FileType::Fifo,
            0xC000 => FileType::Socket,
            _ => return None,
        })
    }
}

/// Inode metadata as reported by `getattr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeAttr {
    /// Inode number (unique within filesystem)
    pub ino: u64,
    pub file_type: FileType,
    /// Permission bits including setuid/setgid/sticky
    pub mode: u16,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u16,
    /// Allocated space in 512-byte units
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl InodeAttr {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::SymLink
    }
}

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    /// From the directory record, when the filesystem stores it there
    pub file_type: Option<FileType>,
}

/// Lazy directory listing
///
/// Yields entries in on-disk order and stops after the first error.
pub type DirStream<'a> = Box<dyn Iterator<Item = KResult<DirEntry>> + Send + 'a>;

pub trait InodeOps: Send + Sync {
    fn ino(&self) -> u64;

    fn getattr(&self) -> KResult<InodeAttr>;

    /// Read from `offset`; returns bytes copied, 0 at or past end of file
    fn read(&self, offset: u64, buf: &mut [u8]) -> KResult<usize>;

    /// Find `name` in this directory
    fn lookup(&self, name: &str) -> KResult<Arc<dyn InodeOps>>;

    /// A fresh listing; calling again restarts from the first entry
    fn readdir(&self) -> KResult<DirStream<'_>>;

    fn readlink(&self) -> KResult<String> {
        Err(Errno::EINVAL)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> KResult<usize> {
        Err(Errno::EROFS)
    }

    fn truncate(&self, _size: u64) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn setattr(&self, _mode: u16, _uid: u32, _gid: u32) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn create(&self, _name: &str, _mode: u16) -> KResult<Arc<dyn InodeOps>> {
        Err(Errno::EROFS)
    }

    fn mkdir(&self, _name: &str, _mode: u16) -> KResult<Arc<dyn InodeOps>> {
        Err(Errno::EROFS)
    }

    fn symlink(&self, _name: &str, _target: &str) -> KResult<Arc<dyn InodeOps>> {
        Err(Errno::EROFS)
    }

    fn link(&self, _name: &str, _target: &Arc<dyn InodeOps>) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn unlink(&self, _name: &str) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn rmdir(&self, _name: &str) -> KResult<()> {
        Err(Errno::EROFS)
    }

    fn rename(&self, _old: &str, _new_dir: &Arc<dyn InodeOps>, _new: &str) -> KResult<()> {
        Err(Errno::EROFS)
    }
}
