//! ext2 block group descriptor structures
//!
//! Block groups divide the filesystem into manageable chunks, each with its own
//! inode and block bitmaps, inode table, and data blocks.

use super::Ext2Superblock;
use crate::error::{Errno, KResult};
use alloc::vec::Vec;
use byteorder::{ByteOrder, LittleEndian};

/// On-disk descriptor size
pub const GROUP_DESC_SIZE: usize = 32;

/// Block group descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2BlockGroupDesc {
    pub bg_block_bitmap: u32,
    pub bg_inode_bitmap: u32,
    /// Inode table start block
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
}

impl Ext2BlockGroupDesc {
    pub fn parse(raw: &[u8]) -> Self {
        Self {
            bg_block_bitmap: LittleEndian::read_u32(&raw[0..4]),
            bg_inode_bitmap: LittleEndian::read_u32(&raw[4..8]),
            bg_inode_table: LittleEndian::read_u32(&raw[8..12]),
            bg_free_blocks_count: LittleEndian::read_u16(&raw[12..14]),
            bg_free_inodes_count: LittleEndian::read_u16(&raw[14..16]),
            bg_used_dirs_count: LittleEndian::read_u16(&raw[16..18]),
        }
    }
}

/// Block holding the first descriptor
///
/// The table starts in the block after the superblock: block 2 with 1 KiB
/// blocks (superblock in block 1), block 1 otherwise (superblock inside
/// block 0).
pub fn table_block(sb: &Ext2Superblock) -> u64 {
    sb.s_first_data_block as u64 + 1
}

/// Bytes occupied by the descriptor table
pub fn table_bytes(sb: &Ext2Superblock) -> usize {
    sb.block_group_count() as usize * GROUP_DESC_SIZE
}

/// Decode the descriptor table and check every inode table lies inside the
/// filesystem
pub fn parse_table(raw: &[u8], sb: &Ext2Superblock) -> KResult<Vec<Ext2BlockGroupDesc>> {
    let count = sb.block_group_count() as usize;
    if raw.len() < count * GROUP_DESC_SIZE {
        return Err(Errno::EUCLEAN);
    }

    let table_blocks = (sb.s_inodes_per_group as u64 * sb.inode_size() as u64).div_ceil(sb.block_size() as u64);
    let first_after_table = table_block(sb) + (table_bytes(sb) as u64).div_ceil(sb.block_size() as u64);

    let mut groups = Vec::with_capacity(count);
    for (index, raw) in raw.chunks_exact(GROUP_DESC_SIZE).take(count).enumerate() {
        let desc = Ext2BlockGroupDesc::parse(raw);
        let start = desc.bg_inode_table as u64;
        if start < first_after_table || start + table_blocks > sb.s_blocks_count as u64 {
            log::warn!(
                "ext2: group {} inode table at block {} (+{}) is outside the filesystem",
                index,
                start,
                table_blocks
            );
            return Err(Errno::EUCLEAN);
        }
        groups.push(desc);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Ext2Builder;

    #[test]
    fn test_table_location() {
        let image = Ext2Builder::new(1024, 256).build();
        let sb = Ext2Superblock::parse(&image[1024..2048]).unwrap();
        assert_eq!(table_block(&sb), 2);

        let image = Ext2Builder::new(4096, 64).build();
        let sb = Ext2Superblock::parse(&image[1024..2048]).unwrap();
        assert_eq!(table_block(&sb), 1);
    }

    #[test]
    fn test_parse_builder_table() {
        let image = Ext2Builder::new(1024, 256).build();
        let sb = Ext2Superblock::parse(&image[1024..2048]).unwrap();
        let groups = parse_table(&image[2048..3072], &sb).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].bg_inode_table, 5);
    }

    #[test]
    fn test_inode_table_out_of_range() {
        let mut image = Ext2Builder::new(1024, 256).build();
        LittleEndian::write_u32(&mut image[2048 + 8..], 255);
        let sb = Ext2Superblock::parse(&image[1024..2048]).unwrap();
        assert_eq!(parse_table(&image[2048..3072], &sb), Err(Errno::EUCLEAN));
    }
}
