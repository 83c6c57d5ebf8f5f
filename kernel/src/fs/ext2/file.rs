//! ext2 file data access
//!
//! Logical-to-physical block mapping through the direct, single-indirect
//! and double-indirect pointers, and byte-range reads on top of it. Every
//! block is read through the page cache.

use super::inode::{Ext2Inode, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS};
use super::Ext2Fs;
use crate::error::{Errno, KResult};
use byteorder::{ByteOrder, LittleEndian};

/// Where the pointer for a logical block lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPath {
    /// `i_block[n]`
    Direct(usize),
    /// Slot in the single-indirect block
    Indirect(u64),
    /// Slot in the double-indirect block, then slot in that indirect block
    DoubleIndirect(u64, u64),
}

/// Classify a logical block number
///
/// Blocks past the double-indirect range would need the triple-indirect
/// pointer, which is not supported: they fail with `EFBIG`.
pub fn block_path(logical: u64, ptrs_per_block: u64) -> KResult<BlockPath> {
    let direct = EXT2_NDIR_BLOCKS as u64;
    if logical < direct {
        return Ok(BlockPath::Direct(logical as usize));
    }
    let rel = logical - direct;
    if rel < ptrs_per_block {
        return Ok(BlockPath::Indirect(rel));
    }
    let rel = rel - ptrs_per_block;
    if rel < ptrs_per_block * ptrs_per_block {
        return Ok(BlockPath::DoubleIndirect(rel / ptrs_per_block, rel % ptrs_per_block));
    }
    Err(Errno::EFBIG)
}

/// Blocks reachable without the triple-indirect pointer
pub fn max_mapped_blocks(ptrs_per_block: u64) -> u64 {
    EXT2_NDIR_BLOCKS as u64 + ptrs_per_block + ptrs_per_block * ptrs_per_block
}

impl Ext2Fs {
    /// A block number taken from disk must lie inside the filesystem
    fn check_block(&self, block: u32) -> KResult<u32> {
        if block < self.superblock.s_first_data_block || block >= self.superblock.s_blocks_count {
            log::warn!("ext2: block pointer {} out of range", block);
            return Err(Errno::EUCLEAN);
        }
        Ok(block)
    }

    /// Pointer `index` of the indirect block `table`; `None` for a hole
    fn read_ptr(&self, table: u32, index: u64) -> KResult<Option<u32>> {
        let mut raw = [0u8; 4];
        let pos = table as u64 * self.block_size() as u64 + index * 4;
        self.read_bytes(pos, &mut raw)?;
        match LittleEndian::read_u32(&raw) {
            0 => Ok(None),
            block => self.check_block(block).map(Some),
        }
    }

    fn nonzero(&self, block: u32) -> KResult<Option<u32>> {
        match block {
            0 => Ok(None),
            block => self.check_block(block).map(Some),
        }
    }

    /// Physical block for logical block `logical` of `inode`
    ///
    /// Returns `None` for a sparse block: a zero pointer anywhere on the
    /// path means the block reads as zeros.
    pub fn map_block(&self, inode: &Ext2Inode, logical: u64) -> KResult<Option<u32>> {
        let ptrs = (self.block_size() / 4) as u64;
        match block_path(logical, ptrs)? {
            BlockPath::Direct(slot) => self.nonzero(inode.i_block[slot]),
            BlockPath::Indirect(slot) => match self.nonzero(inode.i_block[EXT2_IND_BLOCK])? {
                Some(table) => self.read_ptr(table, slot),
                None => Ok(None),
            },
            BlockPath::DoubleIndirect(outer, inner) => {
                let Some(dind) = self.nonzero(inode.i_block[EXT2_DIND_BLOCK])? else {
                    return Ok(None);
                };
                match self.read_ptr(dind, outer)? {
                    Some(table) => self.read_ptr(table, inner),
                    None => Ok(None),
                }
            }
        }
    }

    /// Read file data starting at `offset`
    ///
    /// # Returns
    /// Bytes copied into `buf`: `min(buf.len(), size - offset)`, or 0 at or
    /// past end of file. Holes read as zeros without any I/O.
    pub fn read(&self, inode: &Ext2Inode, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let size = inode.size();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        let block_size = self.block_size();

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let logical = pos / block_size as u64;
            let within = (pos % block_size as u64) as usize;
            let n = (block_size - within).min(len - done);
            let dst = &mut buf[done..done + n];

            match self.map_block(inode, logical)? {
                Some(block) => {
                    let start = block as u64 * block_size as u64 + within as u64;
                    self.read_bytes(start, dst)?;
                }
                None => dst.fill(0),
            }
            done += n;
        }
        log::trace!("ext2: read {} bytes of inode {} at {}", len, inode.ino, offset);
        Ok(len)
    }
}
