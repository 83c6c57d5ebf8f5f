//! ext2 Inode Structures
//!
//! On-disk inode decoding: file type, permissions, size and the block
//! pointer array. Locating an inode on disk lives in [`inode_location`].

use super::{Ext2BlockGroupDesc, Ext2Superblock};
use crate::error::{Errno, KResult};
use crate::fs::vfs::{FileType, InodeAttr};
use byteorder::{ByteOrder, LittleEndian};

/// Root directory inode
pub const EXT2_ROOT_INO: u32 = 2;

/// File type constants (from i_mode upper bits)
pub const EXT2_S_IFSOCK: u16 = 0xC000;
pub const EXT2_S_IFLNK: u16 = 0xA000;
pub const EXT2_S_IFREG: u16 = 0x8000;
pub const EXT2_S_IFBLK: u16 = 0x6000;
pub const EXT2_S_IFDIR: u16 = 0x4000;
pub const EXT2_S_IFCHR: u16 = 0x2000;
pub const EXT2_S_IFIFO: u16 = 0x1000;

/// File type mask
const EXT2_S_IFMT: u16 = 0xF000;
/// Permission mask (including setuid/setgid/sticky)
const EXT2_S_PERM_MASK: u16 = 0x0FFF;

/// Block pointer slots
pub const EXT2_NDIR_BLOCKS: usize = 12;
pub const EXT2_IND_BLOCK: usize = 12;
pub const EXT2_DIND_BLOCK: usize = 13;
pub const EXT2_TIND_BLOCK: usize = 14;
pub const EXT2_N_BLOCKS: usize = 15;

/// Bytes of symlink target stored in the block array itself
pub const FAST_SYMLINK_MAX: usize = EXT2_N_BLOCKS * 4;

/// ext2 inode (first 128 bytes, common to all revisions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2Inode {
    /// Inode number this was read from
    pub ino: u32,
    pub i_mode: u16,
    pub i_uid: u32,
    /// Size in bytes (lower 32 bits)
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u32,
    pub i_links_count: u16,
    /// Blocks count (in 512-byte units)
    pub i_blocks: u32,
    pub i_flags: u32,
    /// [0-11]: direct, [12]: single indirect, [13]: double indirect,
    /// [14]: triple indirect
    pub i_block: [u32; EXT2_N_BLOCKS],
    pub i_file_acl: u32,
    /// High 32 bits of the size for regular files
    pub i_dir_acl: u32,
}

impl Ext2Inode {
    /// Parse an inode from its on-disk bytes
    ///
    /// # Arguments
    /// * `ino` - the inode number, recorded for later use
    /// * `raw` - at least 128 bytes
    pub fn parse(ino: u32, raw: &[u8]) -> KResult<Self> {
        if raw.len() < 128 {
            return Err(Errno::EINVAL);
        }
        let mut i_block = [0u32; EXT2_N_BLOCKS];
        LittleEndian::read_u32_into(&raw[40..100], &mut i_block);

        // osd2 carries the high halves of uid and gid on Linux
        let uid_high = LittleEndian::read_u16(&raw[120..122]) as u32;
        let gid_high = LittleEndian::read_u16(&raw[122..124]) as u32;

        Ok(Self {
            ino,
            i_mode: LittleEndian::read_u16(&raw[0..2]),
            i_uid: LittleEndian::read_u16(&raw[2..4]) as u32 | (uid_high << 16),
            i_size: LittleEndian::read_u32(&raw[4..8]),
            i_atime: LittleEndian::read_u32(&raw[8..12]),
            i_ctime: LittleEndian::read_u32(&raw[12..16]),
            i_mtime: LittleEndian::read_u32(&raw[16..20]),
            i_dtime: LittleEndian::read_u32(&raw[20..24]),
            i_gid: LittleEndian::read_u16(&raw[24..26]) as u32 | (gid_high << 16),
            i_links_count: LittleEndian::read_u16(&raw[26..28]),
            i_blocks: LittleEndian::read_u32(&raw[28..32]),
            i_flags: LittleEndian::read_u32(&raw[32..36]),
            i_block,
            i_file_acl: LittleEndian::read_u32(&raw[104..108]),
            i_dir_acl: LittleEndian::read_u32(&raw[108..112]),
        })
    }

    /// Get the file type from the mode field
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.i_mode & EXT2_S_IFMT)
    }

    pub fn is_dir(&self) -> bool {
        self.i_mode & EXT2_S_IFMT == EXT2_S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.i_mode & EXT2_S_IFMT == EXT2_S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.i_mode & EXT2_S_IFMT == EXT2_S_IFLNK
    }

    /// File size in bytes
    ///
    /// Regular files use `i_dir_acl` as the upper 32 bits.
    pub fn size(&self) -> u64 {
        if self.is_file() {
            ((self.i_dir_acl as u64) << 32) | self.i_size as u64
        } else {
            self.i_size as u64
        }
    }

    /// Permission bits (lower 12 bits of mode)
    pub fn permissions(&self) -> u16 {
        self.i_mode & EXT2_S_PERM_MASK
    }

    /// Target stored inline in `i_block` rather than in a data block
    ///
    /// An xattr block also counts towards `i_blocks`, in which case only the
    /// length tells the two kinds apart.
    pub fn is_fast_symlink(&self) -> bool {
        if !self.is_symlink() {
            return false;
        }
        if self.i_file_acl == 0 {
            self.i_blocks == 0
        } else {
            self.size() < FAST_SYMLINK_MAX as u64
        }
    }

    /// The block array as raw bytes
    pub fn inline_data(&self) -> [u8; FAST_SYMLINK_MAX] {
        let mut raw = [0u8; FAST_SYMLINK_MAX];
        LittleEndian::write_u32_into(&self.i_block, &mut raw);
        raw
    }

    pub fn attr(&self) -> KResult<InodeAttr> {
        let file_type = self.file_type().ok_or_else(|| {
            log::warn!("ext2: inode {} has unknown mode {:#o}", self.ino, self.i_mode);
            Errno::EUCLEAN
        })?;
        Ok(InodeAttr {
            ino: self.ino as u64,
            file_type,
            mode: self.permissions(),
            size: self.size(),
            uid: self.i_uid,
            gid: self.i_gid,
            nlink: self.i_links_count,
            blocks: self.i_blocks as u64,
            atime: self.i_atime as u64,
            mtime: self.i_mtime as u64,
            ctime: self.i_ctime as u64,
        })
    }
}

/// Byte offset of inode `ino` on the filesystem
///
/// Inode numbers are 1-indexed: inode n lives in group
/// `(n - 1) / inodes_per_group` at index `(n - 1) % inodes_per_group` of
/// that group's inode table.
pub fn inode_location(ino: u32, sb: &Ext2Superblock, groups: &[Ext2BlockGroupDesc]) -> KResult<u64> {
    if ino == 0 || ino > sb.s_inodes_count {
        return Err(Errno::EINVAL);
    }
    let index = ino - 1;
    let group = (index / sb.s_inodes_per_group) as usize;
    let local = (index % sb.s_inodes_per_group) as u64;
    let desc = groups.get(group).ok_or(Errno::EUCLEAN)?;

    Ok(desc.bg_inode_table as u64 * sb.block_size() as u64 + local * sb.inode_size() as u64)
}
