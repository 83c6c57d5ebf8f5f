//! Block Device Abstraction Layer
//!
//! Every disk the kernel knows about is a [`BlockDevice`] owned by the
//! [`BlockDeviceRegistry`]. A device is backed either by a physical driver
//! (anything implementing [`BlockDeviceOps`], e.g. virtio-blk) or by a
//! [`PartitionView`] that forwards to its parent with a fixed LBA offset.
//! The backend is chosen once, when the device is built, and requests are
//! bounds-checked here before they reach it.

use crate::drivers::virtio::VirtioError;
use crate::error::Errno;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

pub mod partition;
pub mod registry;
pub mod request;

pub use partition::{PartitionType, PartitionView};
pub use registry::BlockDeviceRegistry;
pub use request::{BlockOp, BlockRequest, RequestQueue};

/// Sector size used for all LBA addressing
pub const SECTOR_SIZE: usize = 512;

/// Major number for virtio block devices
pub const VIRTIO_BLK_MAJOR: u32 = 254;

/// Minor numbers reserved per physical disk (the disk itself plus its partitions)
pub const MINORS_PER_DISK: u32 = 16;

/// Driver-side operations for a physical block device
///
/// `buf.len()` is always a non-zero multiple of the device's sector size and
/// the range has already been checked against the device capacity.
pub trait BlockDeviceOps: Send + Sync {
    /// Read `buf.len() / sector_size` sectors starting at `lba`
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write `buf.len() / sector_size` sectors starting at `lba`
    fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError>;

    /// Commit volatile device caches to stable storage
    fn flush(&self) -> Result<(), BlockError>;
}

/// Errors that can occur during block device operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The device reported a failure
    IoError,
    /// Request extends past the end of the device
    OutOfBounds,
    /// Buffer length is zero or not a multiple of the sector size
    InvalidBuffer,
    /// Device (or a partition's parent) is gone or not initialized
    DeviceNotReady,
    /// Write issued to a read-only device
    ReadOnly,
    /// The device rejected the request type
    Unsupported,
    /// A device with this name or id is already registered
    AlreadyExists,
    /// No device with this name
    NotFound,
    /// On-disk structure failed validation
    InvalidStructure,
    /// Every cached buffer is pinned
    CacheExhausted,
    /// Buffers for the device are still referenced
    Busy,
    /// Transport or virtqueue failure
    Virtio(VirtioError),
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::IoError => write!(f, "I/O error"),
            BlockError::OutOfBounds => write!(f, "sector range out of bounds"),
            BlockError::InvalidBuffer => write!(f, "buffer is not a whole number of sectors"),
            BlockError::DeviceNotReady => write!(f, "device not ready"),
            BlockError::ReadOnly => write!(f, "device is read-only"),
            BlockError::Unsupported => write!(f, "request not supported by device"),
            BlockError::AlreadyExists => write!(f, "device already registered"),
            BlockError::NotFound => write!(f, "no such device"),
            BlockError::InvalidStructure => write!(f, "invalid on-disk structure"),
            BlockError::CacheExhausted => write!(f, "no evictable cache buffers"),
            BlockError::Busy => write!(f, "device buffers still in use"),
            BlockError::Virtio(e) => write!(f, "virtio: {}", e),
        }
    }
}

impl From<VirtioError> for BlockError {
    fn from(e: VirtioError) -> Self {
        BlockError::Virtio(e)
    }
}

impl From<BlockError> for Errno {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::IoError | BlockError::CacheExhausted | BlockError::Unsupported => Errno::EIO,
            BlockError::OutOfBounds => Errno::ERANGE,
            BlockError::InvalidBuffer => Errno::EINVAL,
            BlockError::DeviceNotReady => Errno::ENXIO,
            BlockError::ReadOnly => Errno::EROFS,
            BlockError::AlreadyExists => Errno::EEXIST,
            BlockError::NotFound => Errno::ENODEV,
            BlockError::InvalidStructure => Errno::EUCLEAN,
            BlockError::Busy => Errno::EBUSY,
            BlockError::Virtio(v) => v.into(),
        }
    }
}

/// Device identity, unique within a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Where a device's sectors actually live
pub enum DeviceBackend {
    /// A driver talking to hardware
    Physical(Arc<dyn BlockDeviceOps>),
    /// A slice of another registered device
    Partition(PartitionView),
}

/// A registered block device
pub struct BlockDevice {
    name: String,
    id: DeviceId,
    capacity_sectors: u64,
    sector_size: usize,
    read_only: bool,
    backend: DeviceBackend,
}

impl BlockDevice {
    /// Build a device backed by a physical driver
    pub fn physical(
        name: &str,
        id: DeviceId,
        capacity_sectors: u64,
        ops: Arc<dyn BlockDeviceOps>,
    ) -> Result<Self, BlockError> {
        if capacity_sectors == 0 {
            return Err(BlockError::DeviceNotReady);
        }
        Ok(Self {
            name: String::from(name),
            id,
            capacity_sectors,
            sector_size: SECTOR_SIZE,
            read_only: false,
            backend: DeviceBackend::Physical(ops),
        })
    }

    /// Build a partition device covering `view` on its parent
    ///
    /// Fails if the view is empty or does not fit inside the parent.
    pub fn partition(
        name: &str,
        id: DeviceId,
        parent: &Arc<BlockDevice>,
        view: PartitionView,
    ) -> Result<Self, BlockError> {
        let end = view
            .start_lba()
            .checked_add(view.sector_count())
            .ok_or(BlockError::OutOfBounds)?;
        if view.sector_count() == 0 || end > parent.capacity_sectors {
            return Err(BlockError::OutOfBounds);
        }
        Ok(Self {
            name: String::from(name),
            id,
            capacity_sectors: view.sector_count(),
            sector_size: parent.sector_size,
            read_only: parent.read_only,
            backend: DeviceBackend::Partition(view),
        })
    }

    /// Mark the device read-only; writes fail with [`BlockError::ReadOnly`]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Total device size in bytes
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * self.sector_size as u64
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_partition(&self) -> bool {
        matches!(self.backend, DeviceBackend::Partition(_))
    }

    /// The partition view, for partition devices
    pub fn partition_view(&self) -> Option<&PartitionView> {
        match &self.backend {
            DeviceBackend::Partition(view) => Some(view),
            DeviceBackend::Physical(_) => None,
        }
    }

    /// The parent device, for partition devices whose parent is still alive
    pub fn parent(&self) -> Option<Arc<BlockDevice>> {
        self.partition_view().and_then(|view| view.parent())
    }

    /// Validate a request and return the number of sectors it covers
    fn check_request(&self, lba: u64, len: usize) -> Result<u64, BlockError> {
        if len % self.sector_size != 0 {
            return Err(BlockError::InvalidBuffer);
        }
        let count = (len / self.sector_size) as u64;
        let end = lba.checked_add(count).ok_or(BlockError::OutOfBounds)?;
        if end > self.capacity_sectors {
            return Err(BlockError::OutOfBounds);
        }
        Ok(count)
    }

    /// Read whole sectors starting at `lba`
    pub fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if self.check_request(lba, buf.len())? == 0 {
            return Ok(());
        }
        match &self.backend {
            DeviceBackend::Physical(ops) => ops.read_sectors(lba, buf),
            DeviceBackend::Partition(view) => view.read_sectors(lba, buf),
        }
    }

    /// Write whole sectors starting at `lba`
    pub fn write_sectors(&self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        if self.read_only {
            return Err(BlockError::ReadOnly);
        }
        if self.check_request(lba, buf.len())? == 0 {
            return Ok(());
        }
        match &self.backend {
            DeviceBackend::Physical(ops) => ops.write_sectors(lba, buf),
            DeviceBackend::Partition(view) => view.write_sectors(lba, buf),
        }
    }

    pub fn flush(&self) -> Result<(), BlockError> {
        match &self.backend {
            DeviceBackend::Physical(ops) => ops.flush(),
            DeviceBackend::Partition(view) => view.flush(),
        }
    }
}

impl fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDevice")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("capacity_sectors", &self.capacity_sectors)
            .field("sector_size", &self.sector_size)
            .field("read_only", &self.read_only)
            .field("partition", &self.partition_view())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemDisk;

    fn disk(sectors: u64) -> (Arc<MemDisk>, BlockDevice) {
        let mem = Arc::new(MemDisk::new(sectors));
        let dev = BlockDevice::physical("vda", DeviceId::new(VIRTIO_BLK_MAJOR, 0), sectors, mem.clone())
            .unwrap();
        (mem, dev)
    }

    #[test]
    fn test_read_write_roundtrip_through_backend() {
        let (mem, dev) = disk(8);
        let data = [0xABu8; SECTOR_SIZE * 2];
        dev.write_sectors(3, &data).unwrap();

        let mut back = [0u8; SECTOR_SIZE * 2];
        dev.read_sectors(3, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(mem.writes(), 1);
        assert_eq!(mem.reads(), 1);
    }

    #[test]
    fn test_rejects_partial_sector_buffer() {
        let (_, dev) = disk(8);
        let mut buf = [0u8; 100];
        assert_eq!(dev.read_sectors(0, &mut buf), Err(BlockError::InvalidBuffer));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let (mem, dev) = disk(8);
        let mut buf = [0u8; SECTOR_SIZE * 2];
        assert_eq!(dev.read_sectors(7, &mut buf), Err(BlockError::OutOfBounds));
        assert_eq!(dev.read_sectors(u64::MAX, &mut buf), Err(BlockError::OutOfBounds));
        assert_eq!(mem.reads(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mem = Arc::new(MemDisk::new(0));
        assert!(BlockDevice::physical("vdz", DeviceId::new(1, 0), 0, mem).is_err());
    }

    #[test]
    fn test_read_only_device_refuses_writes() {
        let (mem, dev) = disk(4);
        let dev = dev.with_read_only(true);
        assert_eq!(dev.write_sectors(0, &[0u8; SECTOR_SIZE]), Err(BlockError::ReadOnly));
        assert_eq!(mem.writes(), 0);
    }

    #[test]
    fn test_capacity_bytes() {
        let (_, dev) = disk(2048);
        assert_eq!(dev.capacity_bytes(), 1024 * 1024);
        assert!(!dev.is_partition());
        assert!(dev.parent().is_none());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Errno::from(BlockError::IoError), Errno::EIO);
        assert_eq!(Errno::from(BlockError::CacheExhausted), Errno::EIO);
        assert_eq!(Errno::from(BlockError::OutOfBounds), Errno::ERANGE);
        assert_eq!(Errno::from(BlockError::Busy), Errno::EBUSY);
        assert_eq!(Errno::from(BlockError::Virtio(VirtioError::DescriptorsExhausted)), Errno::ENOMEM);
    }
}
