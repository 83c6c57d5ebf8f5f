//! VirtIO MMIO Transport
//!
//! Register access for virtio-mmio devices, both legacy (v1, queue given as
//! a page frame number) and modern (v2, split 64-bit ring addresses).
//!
//! | Offset | Name | Direction |
//! |--------|------|-----------|
//! | 0x000 | MagicValue | R |
//! | 0x004 | Version | R |
//! | 0x008 | DeviceID | R |
//! | 0x010 | DeviceFeatures | R |
//! | 0x014 | DeviceFeaturesSel | W |
//! | 0x020 | DriverFeatures | W |
//! | 0x024 | DriverFeaturesSel | W |
//! | 0x028 | GuestPageSize | W (v1) |
//! | 0x030 | QueueSel | W |
//! | 0x034 | QueueNumMax | R |
//! | 0x038 | QueueNum | W |
//! | 0x03c | QueueAlign | W (v1) |
//! | 0x040 | QueuePFN | RW (v1) |
//! | 0x044 | QueueReady | RW (v2) |
//! | 0x050 | QueueNotify | W |
//! | 0x070 | Status | RW |
//! | 0x080.. | Queue{Desc,Avail,Used}{Low,High} | W (v2) |
//! | 0x100+ | Config | RW |

use super::{DeviceStatus, QueueLayout, Transport};
use crate::config::MmioWindow;
use core::ptr::{read_volatile, write_volatile};

/// "virt" in little-endian
pub const VIRTIO_MMIO_MAGIC: u32 = 0x74726976;
pub const VIRTIO_MMIO_VERSION_1: u32 = 1;
pub const VIRTIO_MMIO_VERSION_2: u32 = 2;

/// Page size reported to legacy devices
const LEGACY_PAGE_SIZE: u32 = 4096;

mod regs {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    pub const QUEUE_ALIGN: usize = 0x03c;
    pub const QUEUE_PFN: usize = 0x040;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_AVAIL_LOW: usize = 0x090;
    pub const QUEUE_AVAIL_HIGH: usize = 0x094;
    pub const QUEUE_USED_LOW: usize = 0x0a0;
    pub const QUEUE_USED_HIGH: usize = 0x0a4;
    pub const CONFIG: usize = 0x100;
}

/// A virtio-mmio register window
#[derive(Debug)]
pub struct MmioTransport {
    /// Virtual address of the register window
    base: usize,
    device_id: u32,
    version: u32,
}

impl MmioTransport {
    /// Probe for a device at `base` (a mapped virtual address)
    ///
    /// Returns `None` unless the magic value, a known version and a non-zero
    /// device id are all present.
    ///
    /// # Safety
    ///
    /// `base..base + 0x200` must be mapped and either be a virtio-mmio
    /// register block or readable memory without side effects.
    pub unsafe fn probe(base: usize) -> Option<Self> {
        let mut transport = MmioTransport {
            base,
            device_id: 0,
            version: 0,
        };

        if transport.read32(regs::MAGIC) != VIRTIO_MMIO_MAGIC {
            return None;
        }
        let version = transport.read32(regs::VERSION);
        if version != VIRTIO_MMIO_VERSION_1 && version != VIRTIO_MMIO_VERSION_2 {
            log::warn!("virtio-mmio: {:#x} reports unsupported version {}", base, version);
            return None;
        }
        let device_id = transport.read32(regs::DEVICE_ID);
        if device_id == 0 {
            return None;
        }

        transport.version = version;
        transport.device_id = device_id;
        Some(transport)
    }

    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `probe` established that the window is mapped
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: as above
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn write64(&self, low: usize, high: usize, value: u64) {
        self.write32(low, value as u32);
        self.write32(high, (value >> 32) as u32);
    }
}

impl Transport for MmioTransport {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn read_status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.read32(regs::STATUS) as u8)
    }

    fn write_status(&self, status: DeviceStatus) {
        self.write32(regs::STATUS, status.bits() as u32);
    }

    fn read_device_features(&self) -> u64 {
        self.write32(regs::DEVICE_FEATURES_SEL, 0);
        let low = self.read32(regs::DEVICE_FEATURES) as u64;
        self.write32(regs::DEVICE_FEATURES_SEL, 1);
        let high = self.read32(regs::DEVICE_FEATURES) as u64;
        (high << 32) | low
    }

    fn write_driver_features(&self, features: u64) {
        self.write32(regs::DRIVER_FEATURES_SEL, 0);
        self.write32(regs::DRIVER_FEATURES, features as u32);
        self.write32(regs::DRIVER_FEATURES_SEL, 1);
        self.write32(regs::DRIVER_FEATURES, (features >> 32) as u32);
    }

    fn max_queue_size(&self, queue: u16) -> u16 {
        self.write32(regs::QUEUE_SEL, queue as u32);
        self.read32(regs::QUEUE_NUM_MAX).min(u16::MAX as u32) as u16
    }

    fn queue_in_use(&self, queue: u16) -> bool {
        self.write32(regs::QUEUE_SEL, queue as u32);
        if self.version == VIRTIO_MMIO_VERSION_1 {
            self.read32(regs::QUEUE_PFN) != 0
        } else {
            self.read32(regs::QUEUE_READY) != 0
        }
    }

    fn setup_queue(&self, queue: u16, layout: &QueueLayout) {
        self.write32(regs::QUEUE_SEL, queue as u32);
        self.write32(regs::QUEUE_NUM, layout.size as u32);

        if self.version == VIRTIO_MMIO_VERSION_1 {
            // Legacy devices derive avail/used from the descriptor table's
            // page and the alignment
            self.write32(regs::GUEST_PAGE_SIZE, LEGACY_PAGE_SIZE);
            self.write32(regs::QUEUE_ALIGN, LEGACY_PAGE_SIZE);
            self.write32(regs::QUEUE_PFN, (layout.desc / LEGACY_PAGE_SIZE as u64) as u32);
        } else {
            self.write64(regs::QUEUE_DESC_LOW, regs::QUEUE_DESC_HIGH, layout.desc);
            self.write64(regs::QUEUE_AVAIL_LOW, regs::QUEUE_AVAIL_HIGH, layout.avail);
            self.write64(regs::QUEUE_USED_LOW, regs::QUEUE_USED_HIGH, layout.used);
            self.write32(regs::QUEUE_READY, 1);
        }
    }

    fn notify(&self, queue: u16) {
        self.write32(regs::QUEUE_NOTIFY, queue as u32);
    }

    fn read_config_u32(&self, offset: usize) -> u32 {
        self.read32(regs::CONFIG + offset)
    }
}

/// Probe every slot of `window`, mapped at `phys + offset`
///
/// # Safety
///
/// Every slot of the window must be mapped at `offset` and safe to read.
pub unsafe fn probe_window(window: MmioWindow, offset: u64) -> impl Iterator<Item = MmioTransport> {
    (0..window.slots).filter_map(move |slot| {
        let addr = (window.slot_addr(slot) + offset) as usize;
        // SAFETY: upheld by the caller for the whole window
        unsafe { MmioTransport::probe(addr) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    const SLOT_WORDS: usize = 0x200 / 4;

    fn fake_slot(words: &mut [u32], version: u32, device_id: u32) {
        words[regs::MAGIC / 4] = VIRTIO_MMIO_MAGIC;
        words[regs::VERSION / 4] = version;
        words[regs::DEVICE_ID / 4] = device_id;
    }

    #[test]
    fn test_probe_recognizes_signature() {
        let mut regs_mem = vec![0u32; SLOT_WORDS];
        fake_slot(&mut regs_mem, 2, 2);
        let t = unsafe { MmioTransport::probe(regs_mem.as_mut_ptr() as usize) }.unwrap();
        assert_eq!(t.device_id(), 2);
        assert_eq!(t.version(), 2);
    }

    #[test]
    fn test_probe_rejects_bad_slots() {
        let mut regs_mem = vec![0u32; SLOT_WORDS];
        assert!(unsafe { MmioTransport::probe(regs_mem.as_mut_ptr() as usize) }.is_none());

        fake_slot(&mut regs_mem, 2, 0);
        assert!(unsafe { MmioTransport::probe(regs_mem.as_mut_ptr() as usize) }.is_none());

        fake_slot(&mut regs_mem, 3, 2);
        assert!(unsafe { MmioTransport::probe(regs_mem.as_mut_ptr() as usize) }.is_none());
    }

    #[test]
    fn test_probe_window_skips_empty_slots() {
        let mut mem = vec![0u32; SLOT_WORDS * 4];
        fake_slot(&mut mem[0..SLOT_WORDS], 2, 2);
        fake_slot(&mut mem[2 * SLOT_WORDS..3 * SLOT_WORDS], 1, 1);
        let window = MmioWindow {
            base: mem.as_mut_ptr() as u64,
            stride: 0x200,
            slots: 4,
        };
        let found: Vec<u32> = unsafe { probe_window(window, 0) }.map(|t| t.device_id()).collect();
        assert_eq!(found, vec![2, 1]);
    }

    #[test]
    fn test_modern_queue_setup_writes_addresses() {
        let mut regs_mem = vec![0u32; SLOT_WORDS];
        fake_slot(&mut regs_mem, 2, 2);
        let t = unsafe { MmioTransport::probe(regs_mem.as_mut_ptr() as usize) }.unwrap();
        t.setup_queue(0, &QueueLayout { size: 64, desc: 0x1_2345_6000, avail: 0x1_2345_6400, used: 0x1_2345_7000 });

        assert_eq!(regs_mem[regs::QUEUE_NUM / 4], 64);
        assert_eq!(regs_mem[regs::QUEUE_DESC_LOW / 4], 0x2345_6000);
        assert_eq!(regs_mem[regs::QUEUE_DESC_HIGH / 4], 0x1);
        assert_eq!(regs_mem[regs::QUEUE_USED_LOW / 4], 0x2345_7000);
        assert_eq!(regs_mem[regs::QUEUE_READY / 4], 1);
        assert!(t.queue_in_use(0));
    }

    #[test]
    fn test_legacy_queue_setup_uses_pfn() {
        let mut regs_mem = vec![0u32; SLOT_WORDS];
        fake_slot(&mut regs_mem, 1, 2);
        let t = unsafe { MmioTransport::probe(regs_mem.as_mut_ptr() as usize) }.unwrap();
        t.setup_queue(0, &QueueLayout { size: 16, desc: 0x8000_0000, avail: 0x8000_0100, used: 0x8000_1000 });

        assert_eq!(regs_mem[regs::GUEST_PAGE_SIZE / 4], 4096);
        assert_eq!(regs_mem[regs::QUEUE_PFN / 4], 0x8_0000);
        assert_eq!(regs_mem[regs::QUEUE_READY / 4], 0);
    }

    #[test]
    fn test_config_reads() {
        let mut regs_mem = vec![0u32; SLOT_WORDS];
        fake_slot(&mut regs_mem, 2, 2);
        regs_mem[regs::CONFIG / 4] = 0x0010_0000;
        regs_mem[regs::CONFIG / 4 + 1] = 0x1;
        let t = unsafe { MmioTransport::probe(regs_mem.as_mut_ptr() as usize) }.unwrap();
        assert_eq!(t.read_config_u64(0), 0x1_0010_0000);
    }
}
