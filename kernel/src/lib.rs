//! Block storage stack for a research kernel
//!
//! Layers, bottom-up:
//! - [`drivers::virtio`]: virtio-mmio transport, split virtqueues and the
//!   virtio-blk driver
//! - [`block`]: the named block device registry and MBR/GPT partition
//!   detection
//! - [`memory`]: DMA-capable memory for the drivers and the sector cache
//! - [`fs`]: the VFS traits, the mount table and a read-only ext2 driver
//!
//! [`Storage`] ties them together. At boot the kernel calls
//! [`storage::init`], probes the virtio-mmio window and optionally
//! automounts the first ext2 volume it finds.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fs;
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use block::{BlockDevice, BlockDeviceRegistry, DeviceId, MINORS_PER_DISK, VIRTIO_BLK_MAJOR};
use config::StorageConfig;
use drivers::virtio::block::VirtioBlockDevice;
use drivers::virtio::mmio::{probe_window, MmioTransport};
use drivers::virtio::{DeviceType, Transport};
use error::{Errno, KResult};
use fs::vfs::{InodeOps, MountTable};
use memory::{DmaPool, PageCache};
use spin::Mutex;

/// Disk names run from `vda` to `vdz`
const MAX_VIRTIO_DISKS: u32 = 26;

/// The storage stack: device registry, shared cache and mount table
pub struct Storage {
    config: StorageConfig,
    registry: Arc<BlockDeviceRegistry>,
    cache: Arc<PageCache>,
    mounts: MountTable,
    /// Index of the next virtio disk; held while a disk is attached
    next_disk: Mutex<u32>,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        let registry = Arc::new(BlockDeviceRegistry::new());
        let cache = Arc::new(PageCache::new(config.cache_max_blocks));
        let mounts = MountTable::new(registry.clone(), cache.clone());
        Self {
            config,
            registry,
            cache,
            mounts,
            next_disk: Mutex::new(0),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BlockDeviceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Bring up a virtio-blk device and register it with its partitions
    ///
    /// # Returns
    /// The disk followed by any partitions found on it.
    pub fn attach_virtio_blk<T: Transport + 'static>(
        &self,
        transport: T,
        dma: &Arc<DmaPool>,
    ) -> KResult<Vec<Arc<BlockDevice>>> {
        let mut next_disk = self.next_disk.lock();
        let index = *next_disk;
        if index >= MAX_VIRTIO_DISKS {
            return Err(Errno::ENOSPC);
        }

        let driver = VirtioBlockDevice::new(transport, dma, &self.config)?;
        let read_only = driver.is_read_only();
        let capacity = driver.capacity();

        let name = format!("vd{}", (b'a' + index as u8) as char);
        let id = DeviceId::new(VIRTIO_BLK_MAJOR, index * MINORS_PER_DISK);
        let device = BlockDevice::physical(&name, id, capacity, Arc::new(driver))?.with_read_only(read_only);
        let disk = self.registry.register(device)?;
        *next_disk += 1;
        drop(next_disk);

        let mut devices = Vec::from([disk.clone()]);
        match block::partition::scan(&self.registry, &disk) {
            Ok(parts) => devices.extend(parts),
            Err(e) => log::warn!("partition: {}: scan failed: {}", name, e),
        }
        Ok(devices)
    }

    /// Probe the configured virtio-mmio window and attach every block device
    ///
    /// A device that fails to initialize is logged and skipped.
    ///
    /// # Returns
    /// Number of disks attached.
    ///
    /// # Safety
    ///
    /// Every slot of `config().mmio_window` must be mapped at
    /// `config().mmio_offset` and safe to read.
    pub unsafe fn probe_virtio_mmio(&self, dma: &Arc<DmaPool>) -> usize {
        let mut attached = 0;
        // SAFETY: upheld by the caller
        let transports = unsafe { probe_window(self.config.mmio_window, self.config.mmio_offset) };
        for transport in transports {
            match transport.device_type() {
                Some(DeviceType::Block) => {}
                Some(other) => {
                    log::debug!("virtio-mmio: {:#x}: skipping {} device", transport.base(), other.name());
                    continue;
                }
                None => continue,
            }
            let base = transport.base();
            match self.attach_virtio_blk::<MmioTransport>(transport, dma) {
                Ok(_) => attached += 1,
                Err(e) => log::warn!("virtio-blk: {:#x}: initialization failed: {}", base, e),
            }
        }
        log::info!("virtio-mmio: {} block device(s) attached", attached);
        attached
    }

    /// Mount the first ext2 volume found at `target`
    ///
    /// Partitions are tried before whole disks.
    ///
    /// # Returns
    /// The mounted device, or `ENOENT` if nothing could be mounted.
    pub fn automount(&self, target: &str) -> KResult<Arc<BlockDevice>> {
        let (parts, disks): (Vec<_>, Vec<_>) = self.registry.list().into_iter().partition(|d| d.is_partition());
        for device in parts.into_iter().chain(disks) {
            match self.mounts.mount(device.name(), target, "ext2", 0, None) {
                Ok(_) => {
                    log::info!("automount: {} on {}", device.name(), target);
                    return Ok(device);
                }
                Err(e) => log::debug!("automount: {}: {}", device.name(), e),
            }
        }
        log::warn!("automount: no ext2 volume for {}", target);
        Err(Errno::ENOENT)
    }

    pub fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        flags: u32,
        data: Option<&str>,
    ) -> KResult<Arc<dyn InodeOps>> {
        self.mounts.mount(source, target, fstype, flags, data)
    }

    pub fn unmount(&self, target: &str) -> KResult<()> {
        self.mounts.unmount(target)
    }
}

/// The kernel-wide storage instance
pub mod storage {
    use super::*;
    use conquer_once::spin::OnceCell;

    static STORAGE: OnceCell<Storage> = OnceCell::uninit();

    /// Create the global storage stack
    ///
    /// Fails with `EBUSY` if it already exists.
    pub fn init(config: StorageConfig) -> KResult<&'static Storage> {
        STORAGE.try_init_once(|| Storage::new(config)).map_err(|_| Errno::EBUSY)?;
        get().ok_or(Errno::EBUSY)
    }

    pub fn get() -> Option<&'static Storage> {
        STORAGE.get()
    }

    /// Boot-time bring-up: create the stack, attach every virtio disk in the
    /// MMIO window and mount `config.automount` if set
    ///
    /// A failed automount is logged; the stack is still returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Storage::probe_virtio_mmio`].
    pub unsafe fn boot(config: StorageConfig, dma: &Arc<DmaPool>) -> KResult<&'static Storage> {
        let storage = init(config)?;
        // SAFETY: upheld by the caller
        unsafe { storage.probe_virtio_mmio(dma) };
        if let Some(target) = config.automount {
            if let Err(e) = storage.automount(target) {
                log::warn!("storage: automount of {} failed: {}", target, e);
            }
        }
        log::info!("storage: {} device(s), cache {}", storage.registry().len(), storage.cache().stats());
        Ok(storage)
    }
}
