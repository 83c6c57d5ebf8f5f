//! Storage stack configuration.
//!
//! Defaults describe the QEMU `virt` machine: 32 virtio-mmio slots starting
//! at 0x0a00_0000, 0x200 bytes apart.

/// Physical address window scanned for virtio-mmio devices at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioWindow {
    /// Physical address of the first slot
    pub base: u64,
    /// Distance between consecutive slots
    pub stride: u64,
    /// Number of slots to probe
    pub slots: usize,
}

impl MmioWindow {
    pub const QEMU_VIRT: MmioWindow = MmioWindow {
        base: 0x0a00_0000,
        stride: 0x200,
        slots: 32,
    };

    /// Physical address of slot `n`
    pub fn slot_addr(&self, n: usize) -> u64 {
        self.base + self.stride * n as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StorageConfig {
    /// Capacity of the page cache, in sectors
    pub cache_max_blocks: usize,
    pub mmio_window: MmioWindow,
    /// Added to MMIO physical addresses to reach their kernel mapping
    pub mmio_offset: u64,
    /// Requested virtqueue depth (clamped to the device maximum)
    pub queue_size: u16,
    /// Largest single transfer, in sectors; bigger requests are split
    pub max_transfer_sectors: usize,
    /// Mount point for the boot-time ext2 automount, if any
    pub automount: Option<&'static str>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_max_blocks: 1024,
            mmio_window: MmioWindow::QEMU_VIRT,
            mmio_offset: 0,
            queue_size: 128,
            max_transfer_sectors: 128,
            automount: None,
        }
    }
}
