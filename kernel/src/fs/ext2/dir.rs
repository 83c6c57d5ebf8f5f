//! ext2 directory records
//!
//! A directory's data is a sequence of variable-length records packed into
//! blocks; a record never crosses a block boundary.

use crate::error::{Errno, KResult};
use crate::fs::vfs::FileType;
use byteorder::{ByteOrder, LittleEndian};

/// Directory entry file types (from d_file_type field, ext2 feature)
pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

/// Fixed part of a record: inode, rec_len, name_len, file_type
pub const DIR_REC_HEADER: usize = 8;
pub const EXT2_NAME_LEN: usize = 255;

/// Map a record's file type byte
pub fn file_type_from_ft(ft: u8) -> Option<FileType> {
    match ft {
        EXT2_FT_REG_FILE => Some(FileType::Regular),
        EXT2_FT_DIR => Some(FileType::Directory),
        EXT2_FT_CHRDEV => Some(FileType::CharDevice),
        EXT2_FT_BLKDEV => Some(FileType::BlockDevice),
        EXT2_FT_FIFO => Some(FileType::Fifo),
        EXT2_FT_SOCK => Some(FileType::Socket),
        EXT2_FT_SYMLINK => Some(FileType::SymLink),
        _ => None,
    }
}

/// One record as laid out on disk
///
/// Layout:
/// - inode: u32 (0 = deleted entry)
/// - rec_len: u16 - total size of this record including padding
/// - name_len: u8
/// - file_type: u8 (EXT2_FT_*, if the FILETYPE feature is set)
/// - name: [u8; name_len], not NUL-terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDirEntry<'a> {
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: &'a [u8],
}

impl RawDirEntry<'_> {
    pub fn is_deleted(&self) -> bool {
        self.inode == 0
    }
}

/// Iterator over the records of one directory block
///
/// Every record is validated before it is returned; a malformed record
/// yields `EUCLEAN` and ends the iteration.
pub struct DirReader<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> DirReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0, failed: false }
    }

    fn corrupt(&mut self, what: &str) -> Option<KResult<RawDirEntry<'a>>> {
        log::warn!("ext2: corrupt directory record at offset {}: {}", self.offset, what);
        self.failed = true;
        Some(Err(Errno::EUCLEAN))
    }
}

impl<'a> Iterator for DirReader<'a> {
    type Item = KResult<RawDirEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.offset..];
        if rest.len() < DIR_REC_HEADER {
            return self.corrupt("truncated header");
        }

        let inode = LittleEndian::read_u32(&rest[0..4]);
        let rec_len = LittleEndian::read_u16(&rest[4..6]);
        let name_len = rest[6] as usize;
        let file_type = rest[7];

        let len = rec_len as usize;
        if len < DIR_REC_HEADER || len % 4 != 0 {
            return self.corrupt("bad rec_len");
        }
        if len > rest.len() {
            return self.corrupt("rec_len crosses block end");
        }
        if DIR_REC_HEADER + name_len > len {
            return self.corrupt("name longer than record");
        }

        self.offset += len;
        Some(Ok(RawDirEntry {
            inode,
            rec_len,
            file_type,
            name: &rest[DIR_REC_HEADER..DIR_REC_HEADER + name_len],
        }))
    }
}
