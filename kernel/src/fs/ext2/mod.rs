//! ext2 filesystem implementation
//!
//! The Second Extended Filesystem (ext2) is a classic Linux filesystem.
//! This driver mounts it read-only on top of any registered block device:
//! the superblock and group descriptors are read once at mount time, and
//! everything else (inodes, indirect blocks, file and directory data) goes
//! through the shared page cache on demand.

pub mod superblock;
pub mod block_group;
pub mod dir;
pub mod inode;
pub mod file;

pub use superblock::*;
pub use block_group::*;
pub use dir::*;
pub use inode::*;
pub use file::*;

use crate::block::BlockDevice;
use crate::error::{Errno, KResult};
use crate::fs::vfs::{DirEntry, DirStream, FileSystem, InodeAttr, InodeOps, StatFs};
use crate::memory::PageCache;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

/// Value of `s_state` after a clean unmount
const EXT2_VALID_FS: u16 = 1;

/// A mounted ext2 filesystem instance
///
/// Holds the superblock, block group descriptors, and the device and cache
/// every read goes through.
pub struct Ext2Fs {
    device: Arc<BlockDevice>,
    cache: Arc<PageCache>,
    superblock: Ext2Superblock,
    groups: Vec<Ext2BlockGroupDesc>,
    /// Cleared at unmount; read-held around every device access
    live: RwLock<bool>,
    /// Handed to the nodes this instance creates
    this: Weak<Ext2Fs>,
}

impl Ext2Fs {
    /// Mount the filesystem on `device`
    ///
    /// A device without the ext2 magic is rejected after reading the
    /// superblock alone.
    ///
    /// # Returns
    /// * `EINVAL` - not ext2, an unsupported feature or block size, or a
    ///   filesystem larger than the device
    /// * `EUCLEAN` - inconsistent superblock or descriptor table
    /// * `EIO` - the device failed
    pub fn mount(device: Arc<BlockDevice>, cache: Arc<PageCache>) -> KResult<Arc<Self>> {
        if device.capacity_bytes() < SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64 {
            return Err(Errno::EINVAL);
        }
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        cache.read_bytes(&device, SUPERBLOCK_OFFSET, &mut raw)?;
        let superblock = Ext2Superblock::parse(&raw)?;
        superblock.validate(device.capacity_bytes())?;

        if superblock.s_state != EXT2_VALID_FS {
            log::warn!("ext2: {} was not cleanly unmounted", device.name());
        }

        let mut table = vec![0u8; table_bytes(&superblock)];
        let table_pos = table_block(&superblock) * superblock.block_size() as u64;
        cache.read_bytes(&device, table_pos, &mut table)?;
        let groups = parse_table(&table, &superblock)?;

        let fs = Arc::new_cyclic(|this| Self {
            device,
            cache,
            superblock,
            groups,
            live: RwLock::new(true),
            this: this.clone(),
        });

        let root = fs.read_inode(EXT2_ROOT_INO)?;
        if !root.is_dir() {
            log::warn!("ext2: root inode is not a directory");
            return Err(Errno::EUCLEAN);
        }

        log::info!(
            "ext2: mounted {} - {} blocks of {} bytes, {} inodes, {} groups",
            fs.device.name(),
            fs.superblock.s_blocks_count,
            fs.block_size(),
            fs.superblock.s_inodes_count,
            fs.groups.len()
        );
        Ok(fs)
    }

    pub fn superblock(&self) -> &Ext2Superblock {
        &self.superblock
    }

    pub fn groups(&self) -> &[Ext2BlockGroupDesc] {
        &self.groups
    }

    pub fn block_size(&self) -> usize {
        self.superblock.block_size()
    }

    /// Whether the instance still serves requests
    pub fn is_live(&self) -> bool {
        *self.live.read()
    }

    fn check_live(&self) -> KResult<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(Errno::ENXIO)
        }
    }

    /// Read filesystem bytes at `pos` through the page cache
    ///
    /// Fails with `ENXIO` after [`shutdown`](FileSystem::shutdown). The
    /// lock is held across the read, so shutdown waits for reads already
    /// under way and none can refill the cache behind it.
    pub(crate) fn read_bytes(&self, pos: u64, buf: &mut [u8]) -> KResult<()> {
        let live = self.live.read();
        if !*live {
            return Err(Errno::ENXIO);
        }
        self.cache.read_bytes(&self.device, pos, buf)?;
        Ok(())
    }

    /// Read an inode from the filesystem
    pub fn read_inode(&self, ino: u32) -> KResult<Ext2Inode> {
        let pos = inode_location(ino, &self.superblock, &self.groups)?;
        let mut raw = [0u8; 128];
        self.read_bytes(pos, &mut raw)?;
        Ext2Inode::parse(ino, &raw)
    }

    /// Lazily iterate the entries of a directory
    pub fn read_dir(&self, dir: &Ext2Inode) -> KResult<ReadDir<'_>> {
        if !dir.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        Ok(ReadDir {
            fs: self,
            dir: *dir,
            block: vec![0u8; self.block_size()],
            block_len: 0,
            offset: 0,
            next_block: 0,
            done: false,
        })
    }

    /// Look up a name in a directory
    ///
    /// # Returns
    /// * `ENOTDIR` - `dir` is not a directory
    /// * `ENOENT` - no entry with that name
    pub fn lookup(&self, dir: &Ext2Inode, name: &str) -> KResult<Ext2Inode> {
        if !dir.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if name.is_empty() || name.len() > EXT2_NAME_LEN {
            return Err(Errno::ENOENT);
        }
        for entry in self.read_dir(dir)? {
            let entry = entry?;
            if entry.name == name {
                return self.read_inode(entry.ino as u32);
            }
        }
        Err(Errno::ENOENT)
    }

    /// Resolve an absolute path from the root directory
    ///
    /// Symlinks are returned as-is, not followed.
    pub fn resolve_path(&self, path: &str) -> KResult<Ext2Inode> {
        if !path.starts_with('/') {
            return Err(Errno::EINVAL);
        }
        let mut current = self.read_inode(EXT2_ROOT_INO)?;
        for component in path.split('/').filter(|s| !s.is_empty()) {
            current = self.lookup(&current, component)?;
        }
        Ok(current)
    }

    /// Target of a symbolic link
    pub fn readlink(&self, inode: &Ext2Inode) -> KResult<String> {
        if !inode.is_symlink() {
            return Err(Errno::EINVAL);
        }
        let len = inode.size() as usize;
        if inode.is_fast_symlink() {
            if len >= FAST_SYMLINK_MAX {
                return Err(Errno::EUCLEAN);
            }
            let raw = inode.inline_data();
            return Ok(String::from_utf8_lossy(&raw[..len]).into_owned());
        }
        if len > self.block_size() {
            return Err(Errno::EUCLEAN);
        }
        let mut target = vec![0u8; len];
        let n = self.read(inode, 0, &mut target)?;
        target.truncate(n);
        Ok(String::from_utf8_lossy(&target).into_owned())
    }

    fn node(&self, inode: Ext2Inode) -> KResult<Arc<dyn InodeOps>> {
        let fs = self.this.upgrade().ok_or(Errno::ENXIO)?;
        Ok(Arc::new(Ext2Node { fs, inode }))
    }
}

impl FileSystem for Ext2Fs {
    fn fs_type(&self) -> &'static str {
        "ext2"
    }

    fn device(&self) -> &Arc<BlockDevice> {
        &self.device
    }

    fn root(&self) -> KResult<Arc<dyn InodeOps>> {
        let root = self.read_inode(EXT2_ROOT_INO)?;
        self.node(root)
    }

    fn statfs(&self) -> StatFs {
        let sb = &self.superblock;
        StatFs {
            fs_type: "ext2",
            block_size: self.block_size() as u64,
            blocks: sb.s_blocks_count as u64,
            free_blocks: sb.s_free_blocks_count as u64,
            available_blocks: sb.s_free_blocks_count.saturating_sub(sb.s_r_blocks_count) as u64,
            files: sb.s_inodes_count as u64,
            free_files: sb.s_free_inodes_count as u64,
            name_max: EXT2_NAME_LEN as u32,
            volume_name: sb.volume_name(),
        }
    }

    fn shutdown(&self) {
        *self.live.write() = false;
        log::debug!("ext2: {} shut down", self.device.name());
    }

    fn resume(&self) {
        *self.live.write() = true;
    }
}

/// Directory listing over the blocks of one directory inode
///
/// Blocks are read one at a time as iteration reaches them. Deleted records
/// are skipped; a corrupt record yields `EUCLEAN` and ends the listing.
pub struct ReadDir<'a> {
    fs: &'a Ext2Fs,
    dir: Ext2Inode,
    block: Vec<u8>,
    block_len: usize,
    offset: usize,
    next_block: u64,
    done: bool,
}

impl ReadDir<'_> {
    /// Start over from the first entry
    pub fn rewind(&mut self) {
        self.block_len = 0;
        self.offset = 0;
        self.next_block = 0;
        self.done = false;
    }

    fn fail(&mut self, err: Errno) -> Option<KResult<DirEntry>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for ReadDir<'_> {
    type Item = KResult<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if self.offset >= self.block_len {
                let pos = self.next_block * self.fs.block_size() as u64;
                if pos >= self.dir.size() {
                    self.done = true;
                    return None;
                }
                match self.fs.read(&self.dir, pos, &mut self.block) {
                    Ok(n) => self.block_len = n,
                    Err(e) => return self.fail(e),
                }
                self.offset = 0;
                self.next_block += 1;
                continue;
            }

            let mut reader = DirReader::new(&self.block[self.offset..self.block_len]);
            let raw = match reader.next() {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return self.fail(e),
                None => {
                    self.offset = self.block_len;
                    continue;
                }
            };
            let rec_len = raw.rec_len as usize;
            if raw.is_deleted() {
                self.offset += rec_len;
                continue;
            }
            if raw.inode > self.fs.superblock.s_inodes_count {
                log::warn!("ext2: directory {} names inode {}", self.dir.ino, raw.inode);
                return self.fail(Errno::EUCLEAN);
            }

            let file_type = if self.fs.superblock.has_incompat(IncompatFeatures::FILETYPE) {
                file_type_from_ft(raw.file_type)
            } else {
                None
            };
            let entry = DirEntry {
                ino: raw.inode as u64,
                name: String::from_utf8_lossy(raw.name).into_owned(),
                file_type,
            };
            self.offset += rec_len;
            return Some(Ok(entry));
        }
    }
}

/// An ext2 inode as seen by the VFS
pub struct Ext2Node {
    fs: Arc<Ext2Fs>,
    inode: Ext2Inode,
}

impl Ext2Node {
    pub fn inode(&self) -> &Ext2Inode {
        &self.inode
    }
}

impl InodeOps for Ext2Node {
    fn ino(&self) -> u64 {
        self.inode.ino as u64
    }

    fn getattr(&self) -> KResult<InodeAttr> {
        self.fs.check_live()?;
        self.inode.attr()
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        self.fs.check_live()?;
        if self.inode.is_dir() {
            return Err(Errno::EISDIR);
        }
        self.fs.read(&self.inode, offset, buf)
    }

    fn lookup(&self, name: &str) -> KResult<Arc<dyn InodeOps>> {
        self.fs.check_live()?;
        let inode = self.fs.lookup(&self.inode, name)?;
        self.fs.node(inode)
    }

    fn readdir(&self) -> KResult<DirStream<'_>> {
        self.fs.check_live()?;
        Ok(Box::new(self.fs.read_dir(&self.inode)?))
    }

    fn readlink(&self) -> KResult<String> {
        self.fs.check_live()?;
        self.fs.readlink(&self.inode)
    }
}
