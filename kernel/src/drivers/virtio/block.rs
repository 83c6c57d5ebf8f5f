//! VirtIO Block Device Driver
//!
//! # VirtIO Block Request Format
//!
//! Each request is one descriptor chain:
//! 1. Request header {type: u32, reserved: u32, sector: u64} - read by device
//! 2. Data buffer - read or written depending on request type (absent for flush)
//! 3. Status byte - written by device
//!
//! # Device Configuration
//!
//! - capacity (u64 at offset 0): disk size in 512-byte sectors
//! - size_max (u32 at offset 8): max segment size, with SIZE_MAX
//! - seg_max (u32 at offset 12): max segments per request, with SEG_MAX
//! - blk_size (u32 at offset 20): logical block size, with BLK_SIZE
//!
//! All I/O is synchronous. One request is in flight at a time: the queue,
//! header and bounce buffer sit behind a single lock held from submission
//! until the completion is consumed.

use super::queue::{Segment, Virtqueue};
use super::{features as common, negotiate, DeviceType, Transport, VirtioError};
use crate::block::{BlockDeviceOps, BlockError, SECTOR_SIZE};
use crate::config::StorageConfig;
use crate::memory::{DmaBuffer, DmaPool};
use alloc::sync::Arc;
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, AtomicU64, Ordering};
use spin::Mutex;

/// VirtIO block request types
mod request_type {
    pub const IN: u32 = 0;
    pub const OUT: u32 = 1;
    pub const FLUSH: u32 = 4;
}

/// VirtIO block status codes
mod status_code {
    pub const OK: u8 = 0;
    pub const IOERR: u8 = 1;
    pub const UNSUPP: u8 = 2;
}

/// Config space offsets
mod config {
    pub const CAPACITY: usize = 0;
    pub const SIZE_MAX: usize = 8;
    pub const BLK_SIZE: usize = 20;
}

bitflags! {
    /// VirtIO block feature bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlkFeatures: u64 {
        /// Maximum size of any single segment is in size_max
        const SIZE_MAX = 1 << 1;
        /// Maximum number of segments in a request is in seg_max
        const SEG_MAX = 1 << 2;
        const GEOMETRY = 1 << 4;
        /// Device is read-only
        const RO = 1 << 5;
        const BLK_SIZE = 1 << 6;
        /// Cache flush command support
        const FLUSH = 1 << 9;
        const TOPOLOGY = 1 << 10;
        const VERSION_1 = common::VERSION_1;
    }
}

/// Features this driver understands
const SUPPORTED: BlkFeatures = BlkFeatures::SIZE_MAX
    .union(BlkFeatures::SEG_MAX)
    .union(BlkFeatures::GEOMETRY)
    .union(BlkFeatures::RO)
    .union(BlkFeatures::BLK_SIZE)
    .union(BlkFeatures::FLUSH)
    .union(BlkFeatures::TOPOLOGY)
    .union(BlkFeatures::VERSION_1);

const HEADER_LEN: usize = 16;
/// Status byte follows the header in the same allocation
const STATUS_OFFSET: usize = HEADER_LEN;

/// Request queue index
const REQUEST_QUEUE: u16 = 0;

/// State touched while a request is in flight
struct Inflight {
    queue: Virtqueue,
    /// Header followed by the status byte
    header: DmaBuffer,
    bounce: DmaBuffer,
}

/// VirtIO block device driver
pub struct VirtioBlockDevice<T: Transport> {
    transport: T,
    inflight: Mutex<Inflight>,
    /// Disk capacity in sectors
    capacity: u64,
    features: BlkFeatures,
    /// Logical block size advertised by the device
    blk_size: u32,
    /// Largest transfer per request, in sectors
    max_transfer_sectors: usize,
    ops_completed: AtomicU64,
}

impl<T: Transport> VirtioBlockDevice<T> {
    /// Bring up a virtio-blk device
    ///
    /// Any failure leaves the device marked FAILED and is reported to the
    /// caller; other devices are unaffected.
    pub fn new(transport: T, dma: &Arc<DmaPool>, cfg: &StorageConfig) -> Result<Self, VirtioError> {
        if transport.device_type() != Some(DeviceType::Block) {
            return Err(VirtioError::WrongDeviceType(transport.device_id()));
        }

        let negotiated = BlkFeatures::from_bits_retain(negotiate(&transport, SUPPORTED.bits())?);
        match Self::setup(transport, dma, cfg, negotiated) {
            Ok(dev) => Ok(dev),
            Err((transport, e)) => {
                transport.write_status(super::DeviceStatus::FAILED);
                Err(e)
            }
        }
    }

    fn setup(
        transport: T,
        dma: &Arc<DmaPool>,
        cfg: &StorageConfig,
        features: BlkFeatures,
    ) -> Result<Self, (T, VirtioError)> {
        let max = transport.max_queue_size(REQUEST_QUEUE);
        if max == 0 || transport.queue_in_use(REQUEST_QUEUE) {
            return Err((transport, VirtioError::QueueUnavailable(REQUEST_QUEUE)));
        }
        // Room for at least one three-descriptor request
        let size = cfg.queue_size.min(max);
        if size < 4 {
            return Err((transport, VirtioError::QueueUnavailable(REQUEST_QUEUE)));
        }
        let size = 1u16 << (15 - size.leading_zeros());

        let mut max_bytes = cfg.max_transfer_sectors.max(1) * SECTOR_SIZE;
        if features.contains(BlkFeatures::SIZE_MAX) {
            let size_max = transport.read_config_u32(config::SIZE_MAX) as usize;
            if size_max >= SECTOR_SIZE {
                max_bytes = max_bytes.min(size_max / SECTOR_SIZE * SECTOR_SIZE);
            }
        }

        let allocated = Virtqueue::new(dma, REQUEST_QUEUE, size).and_then(|queue| {
            let header = dma.alloc(HEADER_LEN + 1, 16)?;
            let bounce = dma.alloc(max_bytes, 4096)?;
            Ok(Inflight { queue, header, bounce })
        });
        let inflight = match allocated {
            Ok(inflight) => inflight,
            Err(e) => return Err((transport, e)),
        };

        transport.setup_queue(REQUEST_QUEUE, &inflight.queue.layout());

        let capacity = transport.read_config_u64(config::CAPACITY);
        let blk_size = if features.contains(BlkFeatures::BLK_SIZE) {
            transport.read_config_u32(config::BLK_SIZE)
        } else {
            SECTOR_SIZE as u32
        };

        transport.driver_ok();

        log::info!(
            "virtio-blk: capacity {} sectors ({} MiB), queue {}, features {:?}",
            capacity,
            capacity * SECTOR_SIZE as u64 / (1024 * 1024),
            size,
            features
        );

        Ok(Self {
            transport,
            inflight: Mutex::new(inflight),
            capacity,
            features,
            blk_size,
            max_transfer_sectors: max_bytes / SECTOR_SIZE,
            ops_completed: AtomicU64::new(0),
        })
    }

    /// Disk capacity in 512-byte sectors
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn features(&self) -> BlkFeatures {
        self.features
    }

    pub fn is_read_only(&self) -> bool {
        self.features.contains(BlkFeatures::RO)
    }

    pub fn blk_size(&self) -> u32 {
        self.blk_size
    }

    pub fn ops_completed(&self) -> u64 {
        self.ops_completed.load(Ordering::Relaxed)
    }

    /// Run one request to completion
    ///
    /// `data_len` bytes of the bounce buffer are attached as the data
    /// segment; a zero length sends a header-and-status chain.
    fn execute(&self, inflight: &mut Inflight, kind: u32, sector: u64, data_len: usize) -> Result<(), BlockError> {
        {
            let hdr = inflight.header.as_mut_slice();
            LittleEndian::write_u32(&mut hdr[0..4], kind);
            LittleEndian::write_u32(&mut hdr[4..8], 0);
            LittleEndian::write_u64(&mut hdr[8..16], sector);
        }
        // SAFETY: the header allocation is HEADER_LEN + 1 bytes
        let status_ptr = unsafe { inflight.header.as_ptr().add(STATUS_OFFSET) };
        // SAFETY: inside the header allocation
        unsafe { write_volatile(status_ptr, 0xFF) };

        let hdr_phys = inflight.header.phys_addr();
        let header = Segment::readable(hdr_phys, HEADER_LEN as u32);
        let status = Segment::writable(hdr_phys + STATUS_OFFSET as u64, 1);

        let head = if data_len == 0 {
            let chain = inflight.queue.allocate_chain(2)?;
            inflight.queue.submit(&self.transport, chain, &[header, status])?
        } else {
            let data = Segment {
                addr: inflight.bounce.phys_addr(),
                len: data_len as u32,
                device_writable: kind == request_type::IN,
            };
            let chain = inflight.queue.allocate_chain(3)?;
            inflight.queue.submit(&self.transport, chain, &[header, data, status])?
        };

        let done = inflight.queue.poll_used()?;
        if done.head != head {
            inflight.queue.debug_dump_chain(head);
            return Err(VirtioError::InvalidChain.into());
        }
        fence(Ordering::SeqCst);
        // SAFETY: device finished writing before publishing the completion
        let status = unsafe { read_volatile(status_ptr) };
        self.ops_completed.fetch_add(1, Ordering::Relaxed);

        match status {
            status_code::OK => Ok(()),
            status_code::UNSUPP => {
                log::warn!("virtio-blk: request type {} unsupported", kind);
                Err(BlockError::Unsupported)
            }
            status_code::IOERR => {
                log::error!("virtio-blk: I/O error at sector {}", sector);
                Err(BlockError::IoError)
            }
            other => {
                log::error!("virtio-blk: unknown status {} at sector {}", other, sector);
                Err(BlockError::IoError)
            }
        }
    }

    fn check_range(&self, lba: u64, len: usize) -> Result<(), BlockError> {
        if len % SECTOR_SIZE != 0 {
            return Err(BlockError::InvalidBuffer);
        }
        match lba.checked_add((len / SECTOR_SIZE) as u64) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(BlockError::OutOfBounds),
        }
    }
}

impl<T: Transport> BlockDeviceOps for VirtioBlockDevice<T> {
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_range(lba, buf.len())?;
        let mut inflight = self.inflight.lock();
        let chunk_bytes = self.max_transfer_sectors * SECTOR_SIZE;
        for (i, chunk) in buf.chunks_mut(chunk_bytes).enumerate() {
            let sector = lba + (i * self.max_transfer_sectors) as u64;
            self.execute(&mut inflight, request_type::IN, sector, chunk.len())?;
            chunk.copy_from_slice(&inflight.bounce.as_slice()[..chunk.len()]);
        }
        Ok(())
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        if self.is_read_only() {
            return Err(BlockError::ReadOnly);
        }
        self.check_range(lba, buf.len())?;
        let mut inflight = self.inflight.lock();
        let chunk_bytes = self.max_transfer_sectors * SECTOR_SIZE;
        for (i, chunk) in buf.chunks(chunk_bytes).enumerate() {
            let sector = lba + (i * self.max_transfer_sectors) as u64;
            inflight.bounce.as_mut_slice()[..chunk.len()].copy_from_slice(chunk);
            self.execute(&mut inflight, request_type::OUT, sector, chunk.len())?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), BlockError> {
        // Without FLUSH the device is write-through
        if !self.features.contains(BlkFeatures::FLUSH) {
            return Ok(());
        }
        let mut inflight = self.inflight.lock();
        self.execute(&mut inflight, request_type::FLUSH, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::virtio::DeviceStatus;
    use crate::testing::{dma_pool, FakeVirtioBlk};
    use alloc::vec;

    fn device(fake: &FakeVirtioBlk) -> VirtioBlockDevice<FakeVirtioBlk> {
        VirtioBlockDevice::new(fake.clone(), &dma_pool(512 * 1024), &StorageConfig::default()).unwrap()
    }

    #[test]
    fn test_init_reads_capacity_and_sets_driver_ok() {
        let fake = FakeVirtioBlk::new(2048);
        let dev = device(&fake);
        assert_eq!(dev.capacity(), 2048);
        assert!(fake.status().contains(DeviceStatus::DRIVER_OK));
        assert!(dev.features().contains(BlkFeatures::FLUSH));
        assert!(fake.queue_ready());
    }

    #[test]
    fn test_read_returns_disk_contents() {
        let fake = FakeVirtioBlk::new(64);
        fake.write_disk(5 * SECTOR_SIZE, b"hello virtio");
        let dev = device(&fake);

        let mut buf = vec![0u8; SECTOR_SIZE * 2];
        dev.read_sectors(5, &mut buf).unwrap();
        assert_eq!(&buf[..12], b"hello virtio");
        assert_eq!(fake.requests(), vec![(request_type::IN, 5)]);
        assert_eq!(dev.ops_completed(), 1);
    }

    #[test]
    fn test_write_lands_on_disk() {
        let fake = FakeVirtioBlk::new(64);
        let dev = device(&fake);
        dev.write_sectors(10, &[0x42u8; SECTOR_SIZE]).unwrap();
        assert_eq!(fake.read_disk(10 * SECTOR_SIZE, SECTOR_SIZE), vec![0x42u8; SECTOR_SIZE]);
    }

    #[test]
    fn test_large_transfer_is_split() {
        let fake = FakeVirtioBlk::new(1024);
        let cfg = StorageConfig { max_transfer_sectors: 8, ..StorageConfig::default() };
        let dev = VirtioBlockDevice::new(fake.clone(), &dma_pool(512 * 1024), &cfg).unwrap();

        let data: Vec<u8> = (0..SECTOR_SIZE * 20).map(|i| (i % 251) as u8).collect();
        dev.write_sectors(100, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        dev.read_sectors(100, &mut back).unwrap();
        assert_eq!(back, data);
        // 8 + 8 + 4 sectors each way
        assert_eq!(fake.requests().len(), 6);
    }

    #[test]
    fn test_io_error_is_reported() {
        let fake = FakeVirtioBlk::new(64);
        fake.fail_sector(7);
        let dev = device(&fake);
        let mut buf = vec![0u8; SECTOR_SIZE];
        assert_eq!(dev.read_sectors(7, &mut buf), Err(BlockError::IoError));
        // the queue is usable afterwards
        dev.read_sectors(6, &mut buf).unwrap();
    }

    #[test]
    fn test_flush_sends_header_only_request() {
        let fake = FakeVirtioBlk::new(64);
        let dev = device(&fake);
        dev.flush().unwrap();
        assert_eq!(fake.requests(), vec![(request_type::FLUSH, 0)]);
        assert_eq!(fake.flushes(), 1);
    }

    #[test]
    fn test_flush_without_feature_is_noop() {
        let fake = FakeVirtioBlk::new(64);
        fake.set_offered(common::VERSION_1);
        let dev = device(&fake);
        dev.flush().unwrap();
        assert!(fake.requests().is_empty());
    }

    #[test]
    fn test_read_only_device() {
        let fake = FakeVirtioBlk::new(64);
        fake.set_offered(common::VERSION_1 | BlkFeatures::RO.bits());
        let dev = device(&fake);
        assert!(dev.is_read_only());
        assert_eq!(dev.write_sectors(0, &[0u8; SECTOR_SIZE]), Err(BlockError::ReadOnly));
    }

    #[test]
    fn test_out_of_range() {
        let fake = FakeVirtioBlk::new(16);
        let dev = device(&fake);
        let mut buf = vec![0u8; SECTOR_SIZE * 2];
        assert_eq!(dev.read_sectors(15, &mut buf), Err(BlockError::OutOfBounds));
        assert!(fake.requests().is_empty());
    }

    #[test]
    fn test_wrong_device_type() {
        let fake = FakeVirtioBlk::new(16);
        fake.set_device_id(1);
        let err = VirtioBlockDevice::new(fake, &dma_pool(64 * 1024), &StorageConfig::default()).err();
        assert_eq!(err, Some(VirtioError::WrongDeviceType(1)));
    }

    #[test]
    fn test_missing_queue_fails_probe() {
        let fake = FakeVirtioBlk::new(16);
        fake.set_queue_max(0);
        let err = VirtioBlockDevice::new(fake.clone(), &dma_pool(64 * 1024), &StorageConfig::default()).err();
        assert_eq!(err, Some(VirtioError::QueueUnavailable(0)));
        assert!(fake.status().contains(DeviceStatus::FAILED));
    }

    #[test]
    fn test_dma_exhaustion_fails_probe() {
        let fake = FakeVirtioBlk::new(16);
        let err = VirtioBlockDevice::new(fake, &dma_pool(4096), &StorageConfig::default()).err();
        assert_eq!(err, Some(VirtioError::DmaExhausted));
    }

    #[test]
    fn test_queue_clamped_to_device_max() {
        let fake = FakeVirtioBlk::new(16);
        fake.set_queue_max(48);
        let _dev = device(&fake);
        assert_eq!(fake.queue_size(), Some(32));
    }
}
