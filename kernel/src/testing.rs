//! Host-side fixtures shared by the unit tests

use crate::block::{BlockDeviceOps, BlockError, SECTOR_SIZE};
use crate::block::partition::Guid;
use crate::drivers::virtio::queue::{desc_flags, VirtqDesc, VirtqUsedElem};
use crate::drivers::virtio::{DeviceStatus, QueueLayout, Transport};
use crate::memory::DmaPool;
use byteorder::{ByteOrder, LittleEndian};
use spin::Mutex;
use std::collections::BTreeMap;
use std::ptr::{read_volatile, write_volatile};
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory disk with I/O counters and fault injection
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    flushes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemDisk {
    pub fn new(sectors: u64) -> Self {
        Self::from_image(vec![0u8; sectors as usize * SECTOR_SIZE])
    }

    /// Wrap an image, padding it to whole sectors
    pub fn from_image(mut image: Vec<u8>) -> Self {
        let padded = image.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        image.resize(padded, 0);
        Self {
            data: Mutex::new(image),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> u64 {
        (self.data.lock().len() / SECTOR_SIZE) as u64
    }

    /// Copy `bytes` to the disk starting at `lba`, bypassing the counters
    pub fn load(&self, lba: u64, bytes: &[u8]) {
        let start = lba as usize * SECTOR_SIZE;
        self.data.lock()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn sector(&self, lba: u64) -> Vec<u8> {
        let start = lba as usize * SECTOR_SIZE;
        self.data.lock()[start..start + SECTOR_SIZE].to_vec()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
        self.flushes.store(0, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn range(&self, lba: u64, len: usize) -> Result<core::ops::Range<usize>, BlockError> {
        let start = (lba as usize).checked_mul(SECTOR_SIZE).ok_or(BlockError::OutOfBounds)?;
        let end = start.checked_add(len).ok_or(BlockError::OutOfBounds)?;
        if end > self.data.lock().len() {
            return Err(BlockError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl BlockDeviceOps for MemDisk {
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(lba, buf.len())?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BlockError::IoError);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(lba, buf.len())?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BlockError::IoError);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.data.lock()[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), BlockError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Identity-mapped DMA pool backed by leaked host memory
pub fn dma_pool(size: usize) -> Arc<DmaPool> {
    let layout = std::alloc::Layout::from_size_align(size, 4096).unwrap();
    // SAFETY: fresh allocation, leaked so it outlives the pool
    let mem = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!mem.is_null());
    Arc::new(unsafe { DmaPool::new(mem, size, mem as u64) })
}

/// Build a 512-byte MBR from `(type, start_lba, sector_count)` entries
pub fn mbr_image(entries: &[(u8, u32, u32)]) -> Vec<u8> {
    let mut sector = vec![0u8; SECTOR_SIZE];
    for (slot, &(kind, start, count)) in entries.iter().enumerate().take(4) {
        let raw = &mut sector[446 + slot * 16..][..16];
        raw[0] = if slot == 0 { 0x80 } else { 0x00 };
        raw[4] = kind;
        LittleEndian::write_u32(&mut raw[8..12], start);
        LittleEndian::write_u32(&mut raw[12..16], count);
    }
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

pub struct GptPart {
    pub type_guid: Guid,
    pub first: u64,
    pub last: u64,
    pub name: &'static str,
}

/// Protective MBR, primary GPT header and a 128-entry array at LBA 2
///
/// Returns `(lba, sector)` pairs to load into a disk of `capacity` sectors.
pub fn gpt_image(capacity: u64, parts: &[GptPart]) -> Vec<(u64, Vec<u8>)> {
    const ENTRIES: usize = 128;
    const ENTRY_SIZE: usize = 128;

    let mut out = vec![(0, mbr_image(&[(0xEE, 1, (capacity - 1).min(u32::MAX as u64) as u32)]))];

    let mut header = vec![0u8; SECTOR_SIZE];
    header[0..8].copy_from_slice(b"EFI PART");
    LittleEndian::write_u32(&mut header[8..12], 0x0001_0000);
    LittleEndian::write_u32(&mut header[12..16], 92);
    LittleEndian::write_u64(&mut header[24..32], 1);
    LittleEndian::write_u64(&mut header[32..40], capacity - 1);
    LittleEndian::write_u64(&mut header[40..48], 34);
    LittleEndian::write_u64(&mut header[48..56], capacity - 34);
    header[56..72].copy_from_slice(&[0x11; 16]);
    LittleEndian::write_u64(&mut header[72..80], 2);
    LittleEndian::write_u32(&mut header[80..84], ENTRIES as u32);
    LittleEndian::write_u32(&mut header[84..88], ENTRY_SIZE as u32);
    out.push((1, header));

    let mut table = vec![0u8; ENTRIES * ENTRY_SIZE];
    for (i, part) in parts.iter().enumerate() {
        let raw = &mut table[i * ENTRY_SIZE..][..ENTRY_SIZE];
        raw[0..16].copy_from_slice(&part.type_guid.0);
        raw[16..32].copy_from_slice(&[i as u8 + 1; 16]);
        LittleEndian::write_u64(&mut raw[32..40], part.first);
        LittleEndian::write_u64(&mut raw[40..48], part.last);
        for (j, unit) in part.name.encode_utf16().take(36).enumerate() {
            LittleEndian::write_u16(&mut raw[56 + j * 2..58 + j * 2], unit);
        }
    }
    for (i, sector) in table.chunks(SECTOR_SIZE).enumerate() {
        out.push((2 + i as u64, sector.to_vec()));
    }
    out
}

const BLK_IN: u32 = 0;
const BLK_OUT: u32 = 1;
const BLK_FLUSH: u32 = 4;

struct FakeState {
    device_id: u32,
    status: u8,
    offered: u64,
    accepted: u64,
    refuse_features: bool,
    queue_max: u16,
    queue: Option<QueueLayout>,
    last_avail: u16,
    auto_complete: bool,
    notifications: usize,
    disk: Vec<u8>,
    requests: Vec<(u32, u64)>,
    failing: Vec<u64>,
    flushes: usize,
}

impl FakeState {
    /// Serve every chain published since the last notify
    fn process(&mut self) {
        let Some(layout) = self.queue else { return };
        let size = layout.size;
        // SAFETY: the rings live in an identity-mapped test DMA pool
        unsafe {
            let avail_idx = read_volatile((layout.avail + 2) as *const u16);
            while self.last_avail != avail_idx {
                let slot = self.last_avail % size;
                let head = read_volatile((layout.avail + 4 + 2 * slot as u64) as *const u16);
                self.last_avail = self.last_avail.wrapping_add(1);

                let mut chain = Vec::new();
                let mut idx = head;
                loop {
                    let desc = read_volatile((layout.desc + 16 * idx as u64) as *const VirtqDesc);
                    chain.push(desc);
                    if desc.flags & desc_flags::NEXT == 0 || chain.len() >= size as usize {
                        break;
                    }
                    idx = desc.next;
                }
                let written = self.serve(&chain);

                let used_idx_ptr = (layout.used + 2) as *mut u16;
                let used = read_volatile(used_idx_ptr);
                let elem = (layout.used + 4 + 8 * (used % size) as u64) as *mut VirtqUsedElem;
                write_volatile(elem, VirtqUsedElem { id: head as u32, len: written });
                fence(Ordering::SeqCst);
                write_volatile(used_idx_ptr, used.wrapping_add(1));
            }
        }
    }

    unsafe fn serve(&mut self, chain: &[VirtqDesc]) -> u32 {
        if chain.len() < 2 {
            return 0;
        }
        let header = std::slice::from_raw_parts(chain[0].addr as *const u8, 16);
        let kind = LittleEndian::read_u32(&header[0..4]);
        let sector = LittleEndian::read_u64(&header[8..16]);
        self.requests.push((kind, sector));

        let mut written = 1;
        let status = match kind {
            BLK_IN | BLK_OUT if chain.len() == 3 => {
                let data = chain[1];
                let start = sector as usize * SECTOR_SIZE;
                let end = start + data.len as usize;
                let sectors = sector..sector + (data.len as u64).div_ceil(SECTOR_SIZE as u64);
                if end > self.disk.len() || self.failing.iter().any(|s| sectors.contains(s)) {
                    1
                } else if kind == BLK_IN {
                    let dst = std::slice::from_raw_parts_mut(data.addr as *mut u8, data.len as usize);
                    dst.copy_from_slice(&self.disk[start..end]);
                    written += data.len;
                    0
                } else {
                    let src = std::slice::from_raw_parts(data.addr as *const u8, data.len as usize);
                    self.disk[start..end].copy_from_slice(src);
                    0
                }
            }
            BLK_FLUSH => {
                self.flushes += 1;
                0
            }
            _ => 2,
        };
        let status_desc = chain[chain.len() - 1];
        write_volatile(status_desc.addr as *mut u8, status);
        written
    }
}

/// Software virtio-blk device
///
/// Clones share the same device. With auto-complete on (the default) every
/// notify services the request queue straight out of guest memory, which
/// requires the queue to live in an identity-mapped [`dma_pool`].
#[derive(Clone)]
pub struct FakeVirtioBlk {
    state: Arc<Mutex<FakeState>>,
}

impl FakeVirtioBlk {
    pub fn new(sectors: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                device_id: 2,
                status: 0,
                offered: crate::drivers::virtio::features::VERSION_1 | (1 << 9) | (1 << 6),
                accepted: 0,
                refuse_features: false,
                queue_max: 256,
                queue: None,
                last_avail: 0,
                auto_complete: true,
                notifications: 0,
                disk: vec![0u8; sectors as usize * SECTOR_SIZE],
                requests: Vec::new(),
                failing: Vec::new(),
                flushes: 0,
            })),
        }
    }

    pub fn set_offered(&self, features: u64) {
        self.state.lock().offered = features;
    }

    pub fn accepted_features(&self) -> u64 {
        self.state.lock().accepted
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.state.lock().status)
    }

    /// Clear FEATURES_OK whenever the driver sets it
    pub fn set_refuse_features(&self, refuse: bool) {
        self.state.lock().refuse_features = refuse;
    }

    pub fn set_auto_complete(&self, on: bool) {
        self.state.lock().auto_complete = on;
    }

    pub fn set_device_id(&self, id: u32) {
        self.state.lock().device_id = id;
    }

    pub fn set_queue_max(&self, max: u16) {
        self.state.lock().queue_max = max;
    }

    pub fn notifications(&self) -> usize {
        self.state.lock().notifications
    }

    pub fn write_disk(&self, offset: usize, bytes: &[u8]) {
        self.state.lock().disk[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_disk(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.lock().disk[offset..offset + len].to_vec()
    }

    /// `(type, sector)` of every request served so far
    pub fn requests(&self) -> Vec<(u32, u64)> {
        self.state.lock().requests.clone()
    }

    /// Answer IOERR for any request touching `sector`
    pub fn fail_sector(&self, sector: u64) {
        self.state.lock().failing.push(sector);
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn queue_ready(&self) -> bool {
        self.state.lock().queue.is_some()
    }

    pub fn queue_size(&self) -> Option<u16> {
        self.state.lock().queue.map(|q| q.size)
    }
}

impl Transport for FakeVirtioBlk {
    fn device_id(&self) -> u32 {
        self.state.lock().device_id
    }

    fn version(&self) -> u32 {
        2
    }

    fn read_status(&self) -> DeviceStatus {
        self.status()
    }

    fn write_status(&self, status: DeviceStatus) {
        let mut state = self.state.lock();
        let mut status = status;
        if state.refuse_features {
            status.remove(DeviceStatus::FEATURES_OK);
        }
        if status.is_empty() {
            state.queue = None;
            state.last_avail = 0;
        }
        state.status = status.bits();
    }

    fn read_device_features(&self) -> u64 {
        self.state.lock().offered
    }

    fn write_driver_features(&self, features: u64) {
        self.state.lock().accepted = features;
    }

    fn max_queue_size(&self, queue: u16) -> u16 {
        if queue == 0 {
            self.state.lock().queue_max
        } else {
            0
        }
    }

    fn queue_in_use(&self, queue: u16) -> bool {
        queue == 0 && self.queue_ready()
    }

    fn setup_queue(&self, queue: u16, layout: &QueueLayout) {
        if queue == 0 {
            self.state.lock().queue = Some(*layout);
        }
    }

    fn notify(&self, _queue: u16) {
        let mut state = self.state.lock();
        state.notifications += 1;
        if state.auto_complete {
            state.process();
        }
    }

    fn read_config_u32(&self, offset: usize) -> u32 {
        let state = self.state.lock();
        let mut config = [0u8; 24];
        LittleEndian::write_u64(&mut config[0..8], (state.disk.len() / SECTOR_SIZE) as u64);
        LittleEndian::write_u32(&mut config[20..24], SECTOR_SIZE as u32);
        if offset + 4 <= config.len() {
            LittleEndian::read_u32(&config[offset..offset + 4])
        } else {
            0
        }
    }
}

/// Builder for small single-group ext2 images
///
/// Directories are laid out when the image is built; file and symlink data
/// is placed immediately. Inode numbers start at 11.
pub struct Ext2Builder {
    block_size: usize,
    total_blocks: u32,
    image: Vec<u8>,
    inodes: Vec<TestInode>,
    dirs: BTreeMap<u32, Vec<(u32, String, u8)>>,
    next_block: u32,
    next_ino: u32,
    inode_table: u32,
    volume_name: &'static str,
}

#[derive(Clone, Copy, Default)]
struct TestInode {
    mode: u16,
    size: u64,
    links: u16,
    sectors: u32,
    block: [u32; 15],
    mtime: u32,
}

pub const TEST_INODES: u32 = 64;
const FT_REG: u8 = 1;
const FT_DIR: u8 = 2;
const FT_SYMLINK: u8 = 7;

impl Ext2Builder {
    pub fn new(block_size: usize, total_blocks: u32) -> Self {
        let first_data_block = if block_size == 1024 { 1 } else { 0 };
        let bgdt = first_data_block + 1;
        let inode_table = bgdt + 3;
        let table_blocks = (TEST_INODES as usize * 128).div_ceil(block_size) as u32;

        let mut builder = Self {
            block_size,
            total_blocks,
            image: vec![0u8; block_size * total_blocks as usize],
            inodes: vec![TestInode::default(); TEST_INODES as usize],
            dirs: BTreeMap::new(),
            next_block: inode_table + table_blocks,
            next_ino: 11,
            inode_table,
            volume_name: "",
        };
        builder.inodes[1] = TestInode { mode: 0o40755, links: 2, mtime: 1_700_000_000, ..TestInode::default() };
        builder.dirs.insert(2, vec![(2, ".".into(), FT_DIR), (2, "..".into(), FT_DIR)]);
        builder
    }

    pub fn volume_name(mut self, name: &'static str) -> Self {
        self.volume_name = name;
        self
    }

    fn alloc_block(&mut self, ino: u32) -> u32 {
        let block = self.next_block;
        assert!(block < self.total_blocks, "test image full");
        self.next_block += 1;
        self.inodes[ino as usize - 1].sectors += (self.block_size / 512) as u32;
        block
    }

    fn alloc_ino(&mut self) -> u32 {
        let ino = self.next_ino;
        assert!(ino <= TEST_INODES);
        self.next_ino += 1;
        ino
    }

    fn block_mut(&mut self, block: u32) -> &mut [u8] {
        let start = block as usize * self.block_size;
        &mut self.image[start..start + self.block_size]
    }

    fn ensure_ptr(&mut self, ino: u32, table: u32, index: usize) -> u32 {
        let current = LittleEndian::read_u32(&self.block_mut(table)[index * 4..]);
        if current != 0 {
            return current;
        }
        let block = self.alloc_block(ino);
        LittleEndian::write_u32(&mut self.block_mut(table)[index * 4..], block);
        block
    }

    /// Allocate the data block for `logical` and any indirect blocks on its path
    fn map_block(&mut self, ino: u32, logical: u64) -> u32 {
        let ptrs = (self.block_size / 4) as u64;
        let i = ino as usize - 1;
        if logical < 12 {
            let block = self.alloc_block(ino);
            self.inodes[i].block[logical as usize] = block;
            return block;
        }
        let l = logical - 12;
        if l < ptrs {
            if self.inodes[i].block[12] == 0 {
                self.inodes[i].block[12] = self.alloc_block(ino);
            }
            let ind = self.inodes[i].block[12];
            return self.ensure_ptr(ino, ind, l as usize);
        }
        let l = l - ptrs;
        assert!(l < ptrs * ptrs, "beyond double indirect");
        if self.inodes[i].block[13] == 0 {
            self.inodes[i].block[13] = self.alloc_block(ino);
        }
        let dind = self.inodes[i].block[13];
        let ind = self.ensure_ptr(ino, dind, (l / ptrs) as usize);
        self.ensure_ptr(ino, ind, (l % ptrs) as usize)
    }

    fn link(&mut self, parent: u32, name: &str, ino: u32, ft: u8) {
        self.dirs.get_mut(&parent).expect("parent is not a directory").push((ino, name.into(), ft));
    }

    pub fn add_file(&mut self, parent: u32, name: &str, content: &[u8]) -> u32 {
        let ino = self.alloc_ino();
        self.inodes[ino as usize - 1] =
            TestInode { mode: 0o100644, size: content.len() as u64, links: 1, mtime: 1_700_000_100, ..TestInode::default() };
        for (logical, chunk) in content.chunks(self.block_size).enumerate() {
            let block = self.map_block(ino, logical as u64);
            self.block_mut(block)[..chunk.len()].copy_from_slice(chunk);
        }
        self.link(parent, name, ino, FT_REG);
        ino
    }

    /// A file of `size` bytes where only the listed logical blocks are
    /// allocated, each filled with its byte
    pub fn add_sparse_file(&mut self, parent: u32, name: &str, size: u64, present: &[(u64, u8)]) -> u32 {
        let ino = self.alloc_ino();
        self.inodes[ino as usize - 1] = TestInode { mode: 0o100644, size, links: 1, ..TestInode::default() };
        for &(logical, fill) in present {
            let block = self.map_block(ino, logical);
            self.block_mut(block).fill(fill);
        }
        self.link(parent, name, ino, FT_REG);
        ino
    }

    /// A file that extends one block into the triple-indirect range
    pub fn add_huge_file(&mut self, parent: u32, name: &str) -> u32 {
        let ptrs = (self.block_size / 4) as u64;
        let blocks = 12 + ptrs + ptrs * ptrs + 1;
        let ino = self.add_sparse_file(parent, name, blocks * self.block_size as u64, &[(0, b'A')]);
        let tind = self.alloc_block(ino);
        self.inodes[ino as usize - 1].block[14] = tind;
        ino
    }

    pub fn add_dir(&mut self, parent: u32, name: &str) -> u32 {
        let ino = self.alloc_ino();
        self.inodes[ino as usize - 1] = TestInode { mode: 0o40755, links: 2, ..TestInode::default() };
        self.inodes[parent as usize - 1].links += 1;
        self.dirs.insert(ino, vec![(ino, ".".into(), FT_DIR), (parent, "..".into(), FT_DIR)]);
        self.link(parent, name, ino, FT_DIR);
        ino
    }

    /// Fast symlink when the target fits in the block array, slow otherwise
    pub fn add_symlink(&mut self, parent: u32, name: &str, target: &str) -> u32 {
        let ino = self.alloc_ino();
        let i = ino as usize - 1;
        self.inodes[i] = TestInode { mode: 0o120777, size: target.len() as u64, links: 1, ..TestInode::default() };
        if target.len() < 60 {
            let mut raw = [0u8; 60];
            raw[..target.len()].copy_from_slice(target.as_bytes());
            for (slot, word) in raw.chunks(4).enumerate() {
                self.inodes[i].block[slot] = LittleEndian::read_u32(word);
            }
        } else {
            let block = self.map_block(ino, 0);
            self.block_mut(block)[..target.len()].copy_from_slice(target.as_bytes());
        }
        self.link(parent, name, ino, FT_SYMLINK);
        ino
    }

    /// A record with inode 0, as left behind by unlink
    pub fn add_deleted_entry(&mut self, parent: u32, name: &str) {
        self.link(parent, name, 0, 0);
    }

    pub fn build(mut self) -> Vec<u8> {
        let bs = self.block_size;
        let dirs = std::mem::take(&mut self.dirs);
        for (ino, entries) in dirs {
            let mut blocks: Vec<Vec<u8>> = Vec::new();
            let mut current: Vec<(usize, usize)> = Vec::new();
            let mut buf = vec![0u8; bs];
            let mut used = 0;
            for (child, name, ft) in &entries {
                let rec = (8 + name.len()).div_ceil(4) * 4;
                if used + rec > bs {
                    Self::close_dir_block(&mut buf, &current, bs);
                    blocks.push(std::mem::replace(&mut buf, vec![0u8; bs]));
                    current.clear();
                    used = 0;
                }
                LittleEndian::write_u32(&mut buf[used..], *child);
                LittleEndian::write_u16(&mut buf[used + 4..], rec as u16);
                buf[used + 6] = name.len() as u8;
                buf[used + 7] = *ft;
                buf[used + 8..used + 8 + name.len()].copy_from_slice(name.as_bytes());
                current.push((used, rec));
                used += rec;
            }
            Self::close_dir_block(&mut buf, &current, bs);
            blocks.push(buf);

            self.inodes[ino as usize - 1].size = (blocks.len() * bs) as u64;
            for (logical, data) in blocks.into_iter().enumerate() {
                let block = self.map_block(ino, logical as u64);
                self.block_mut(block).copy_from_slice(&data);
            }
        }

        for (i, inode) in self.inodes.clone().iter().enumerate() {
            let start = self.inode_table as usize * bs + i * 128;
            let raw = &mut self.image[start..start + 128];
            LittleEndian::write_u16(&mut raw[0..2], inode.mode);
            LittleEndian::write_u32(&mut raw[4..8], inode.size as u32);
            LittleEndian::write_u32(&mut raw[8..12], inode.mtime);
            LittleEndian::write_u32(&mut raw[12..16], inode.mtime);
            LittleEndian::write_u32(&mut raw[16..20], inode.mtime);
            LittleEndian::write_u16(&mut raw[26..28], inode.links);
            LittleEndian::write_u32(&mut raw[28..32], inode.sectors);
            for (slot, ptr) in inode.block.iter().enumerate() {
                LittleEndian::write_u32(&mut raw[40 + slot * 4..44 + slot * 4], *ptr);
            }
            LittleEndian::write_u32(&mut raw[108..112], (inode.size >> 32) as u32);
        }

        let first_data_block = if bs == 1024 { 1u32 } else { 0 };
        let used_inodes = self.next_ino - 1;
        let sb = &mut self.image[1024..2048];
        LittleEndian::write_u32(&mut sb[0..4], TEST_INODES);
        LittleEndian::write_u32(&mut sb[4..8], self.total_blocks);
        LittleEndian::write_u32(&mut sb[8..12], self.total_blocks / 20);
        LittleEndian::write_u32(&mut sb[12..16], self.total_blocks - self.next_block);
        LittleEndian::write_u32(&mut sb[16..20], TEST_INODES - used_inodes);
        LittleEndian::write_u32(&mut sb[20..24], first_data_block);
        LittleEndian::write_u32(&mut sb[24..28], (bs / 1024).trailing_zeros());
        LittleEndian::write_u32(&mut sb[28..32], (bs / 1024).trailing_zeros());
        LittleEndian::write_u32(&mut sb[32..36], 8 * bs as u32);
        LittleEndian::write_u32(&mut sb[36..40], 8 * bs as u32);
        LittleEndian::write_u32(&mut sb[40..44], TEST_INODES);
        LittleEndian::write_u16(&mut sb[56..58], 0xEF53);
        LittleEndian::write_u16(&mut sb[58..60], 1);
        LittleEndian::write_u32(&mut sb[76..80], 1);
        LittleEndian::write_u32(&mut sb[84..88], 11);
        LittleEndian::write_u16(&mut sb[88..90], 128);
        LittleEndian::write_u32(&mut sb[96..100], 0x0002);
        sb[120..120 + self.volume_name.len()].copy_from_slice(self.volume_name.as_bytes());

        let bgdt = (first_data_block + 1) as usize * bs;
        let gd = &mut self.image[bgdt..bgdt + 32];
        LittleEndian::write_u32(&mut gd[0..4], first_data_block + 2);
        LittleEndian::write_u32(&mut gd[4..8], first_data_block + 3);
        LittleEndian::write_u32(&mut gd[8..12], self.inode_table);
        LittleEndian::write_u16(&mut gd[12..14], (self.total_blocks - self.next_block) as u16);
        LittleEndian::write_u16(&mut gd[14..16], (TEST_INODES - used_inodes) as u16);

        self.image
    }

    /// Stretch the last record of a directory block to the block end
    fn close_dir_block(buf: &mut [u8], records: &[(usize, usize)], bs: usize) {
        if let Some(&(offset, _)) = records.last() {
            LittleEndian::write_u16(&mut buf[offset + 4..], (bs - offset) as u16);
        }
    }
}
