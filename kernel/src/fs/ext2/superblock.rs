//! ext2 superblock structures and parsing
//!
//! The superblock contains critical filesystem metadata and is always located
//! at byte offset 1024 from the start of the device.

use crate::error::{Errno, KResult};
use alloc::string::String;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

/// ext2 magic number - identifies an ext2 filesystem
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Superblock offset from start of device (always 1024 bytes)
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;

/// Revision 0 has fixed 128-byte inodes and no feature fields
const EXT2_GOOD_OLD_REV: u32 = 0;
const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;

/// 1 KiB, 2 KiB or 4 KiB blocks
const MAX_LOG_BLOCK_SIZE: u32 = 2;

bitflags! {
    /// Features a driver must understand to mount at all
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        /// Directory records carry a file type byte
        const FILETYPE = 0x0002;
        /// Journal needs replay (ext3)
        const RECOVER = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG = 0x0010;
        /// ext4
        const EXTENTS = 0x0040;
        const BIT64 = 0x0080;
        const FLEX_BG = 0x0200;
    }
}

/// Incompatible features this driver handles
const SUPPORTED_INCOMPAT: IncompatFeatures = IncompatFeatures::FILETYPE;

/// ext2 superblock
///
/// Only the fields the driver uses are decoded; offsets follow the on-disk
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    /// Blocks reserved for the superuser
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    /// 1 for 1 KiB blocks, 0 otherwise
    pub s_first_data_block: u32,
    /// Block size = 1024 << s_log_block_size
    pub s_log_block_size: u32,
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_magic: u16,
    /// 1 = cleanly unmounted, 2 = errors detected
    pub s_state: u16,
    pub s_rev_level: u32,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
}

impl Ext2Superblock {
    /// Decode the 1024 superblock bytes
    ///
    /// Only the magic number is checked here; see [`validate`](Self::validate)
    /// for the rest.
    pub fn parse(bytes: &[u8]) -> KResult<Self> {
        if bytes.len() < SUPERBLOCK_SIZE {
            return Err(Errno::EINVAL);
        }
        let magic = LittleEndian::read_u16(&bytes[56..58]);
        if magic != EXT2_SUPER_MAGIC {
            return Err(Errno::EINVAL);
        }

        let rev_level = LittleEndian::read_u32(&bytes[76..80]);
        let (first_ino, inode_size) = if rev_level == EXT2_GOOD_OLD_REV {
            (EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE)
        } else {
            (LittleEndian::read_u32(&bytes[84..88]), LittleEndian::read_u16(&bytes[88..90]))
        };
        let feature = |offset: usize| {
            if rev_level == EXT2_GOOD_OLD_REV {
                0
            } else {
                LittleEndian::read_u32(&bytes[offset..offset + 4])
            }
        };

        let mut s_uuid = [0u8; 16];
        s_uuid.copy_from_slice(&bytes[104..120]);
        let mut s_volume_name = [0u8; 16];
        s_volume_name.copy_from_slice(&bytes[120..136]);

        Ok(Self {
            s_inodes_count: LittleEndian::read_u32(&bytes[0..4]),
            s_blocks_count: LittleEndian::read_u32(&bytes[4..8]),
            s_r_blocks_count: LittleEndian::read_u32(&bytes[8..12]),
            s_free_blocks_count: LittleEndian::read_u32(&bytes[12..16]),
            s_free_inodes_count: LittleEndian::read_u32(&bytes[16..20]),
            s_first_data_block: LittleEndian::read_u32(&bytes[20..24]),
            s_log_block_size: LittleEndian::read_u32(&bytes[24..28]),
            s_blocks_per_group: LittleEndian::read_u32(&bytes[32..36]),
            s_inodes_per_group: LittleEndian::read_u32(&bytes[40..44]),
            s_mtime: LittleEndian::read_u32(&bytes[44..48]),
            s_wtime: LittleEndian::read_u32(&bytes[48..52]),
            s_magic: magic,
            s_state: LittleEndian::read_u16(&bytes[58..60]),
            s_rev_level: rev_level,
            s_first_ino: first_ino,
            s_inode_size: inode_size,
            s_feature_compat: feature(92),
            s_feature_incompat: feature(96),
            s_feature_ro_compat: feature(100),
            s_uuid,
            s_volume_name,
        })
    }

    /// Reject geometry this driver cannot use and features it does not know
    ///
    /// # Arguments
    /// * `device_bytes` - size of the underlying device, which must hold
    ///   every block the superblock claims
    pub fn validate(&self, device_bytes: u64) -> KResult<()> {
        let incompat = IncompatFeatures::from_bits_retain(self.s_feature_incompat);
        let unknown = incompat.difference(SUPPORTED_INCOMPAT);
        if !unknown.is_empty() {
            log::warn!("ext2: unsupported incompatible features {:#x}", unknown.bits());
            return Err(Errno::EINVAL);
        }

        if self.s_log_block_size > MAX_LOG_BLOCK_SIZE {
            log::warn!("ext2: block size 1024 << {} not supported", self.s_log_block_size);
            return Err(Errno::EINVAL);
        }
        let block_size = self.block_size();
        let expected_first = if block_size == 1024 { 1 } else { 0 };

        let inode_size = self.inode_size();
        let bad_geometry = self.s_blocks_per_group == 0
            || self.s_inodes_per_group == 0
            || self.s_blocks_count <= self.s_first_data_block
            || self.s_first_data_block != expected_first
            || inode_size < EXT2_GOOD_OLD_INODE_SIZE as usize
            || !inode_size.is_power_of_two()
            || inode_size > block_size
            || (self.s_inodes_per_group as u64) * (self.block_group_count() as u64) < self.s_inodes_count as u64;
        if bad_geometry {
            log::warn!(
                "ext2: inconsistent geometry ({} blocks, {}/group, {} inodes, {}/group, inode size {})",
                self.s_blocks_count,
                self.s_blocks_per_group,
                self.s_inodes_count,
                self.s_inodes_per_group,
                inode_size
            );
            return Err(Errno::EUCLEAN);
        }

        if self.s_blocks_count as u64 * block_size as u64 > device_bytes {
            log::warn!(
                "ext2: {} blocks of {} bytes do not fit a {}-byte device",
                self.s_blocks_count,
                block_size,
                device_bytes
            );
            return Err(Errno::EINVAL);
        }
        Ok(())
    }

    /// Calculate block size in bytes
    pub fn block_size(&self) -> usize {
        1024 << self.s_log_block_size
    }

    /// Number of block groups, rounding up
    pub fn block_group_count(&self) -> u32 {
        let data_blocks = self.s_blocks_count.saturating_sub(self.s_first_data_block);
        data_blocks.div_ceil(self.s_blocks_per_group.max(1))
    }

    /// Inode size (128 for rev 0, s_inode_size for rev 1+)
    pub fn inode_size(&self) -> usize {
        self.s_inode_size as usize
    }

    pub fn has_incompat(&self, feature: IncompatFeatures) -> bool {
        IncompatFeatures::from_bits_retain(self.s_feature_incompat).contains(feature)
    }

    /// Volume label, NUL padding removed
    pub fn volume_name(&self) -> String {
        let len = self.s_volume_name.iter().position(|&b| b == 0).unwrap_or(16);
        String::from_utf8_lossy(&self.s_volume_name[..len]).into_owned()
    }
}
