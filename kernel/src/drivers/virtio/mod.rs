//! VirtIO Transport Layer
//!
//! Drivers talk to devices through the [`Transport`] trait. On hardware this
//! is [`mmio::MmioTransport`]; tests plug in a software device.
//!
//! # Initialization sequence
//!
//! 1. Reset (status = 0)
//! 2. ACKNOWLEDGE, then DRIVER
//! 3. Read device features, write the accepted subset
//! 4. FEATURES_OK, and check the device kept it
//! 5. Driver-specific setup (virtqueues, config space)
//! 6. DRIVER_OK

pub mod block;
pub mod mmio;
pub mod queue;

use crate::error::Errno;
use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Device status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest OS has found the device and recognized it as a VirtIO device
        const ACKNOWLEDGE = 1;
        /// Guest OS knows how to drive the device
        const DRIVER = 2;
        /// Driver is ready
        const DRIVER_OK = 4;
        /// Feature negotiation complete
        const FEATURES_OK = 8;
        const DEVICE_NEEDS_RESET = 64;
        /// Something went wrong in the guest
        const FAILED = 128;
    }
}

/// Device-independent feature bits
pub mod features {
    /// Modern (non-legacy) interface
    pub const VERSION_1: u64 = 1 << 32;
    /// Device DMA goes through a platform IOMMU
    pub const ACCESS_PLATFORM: u64 = 1 << 33;
    pub const RING_PACKED: u64 = 1 << 34;

    /// Features a device may offer that change how buffers must be
    /// addressed; a driver that cannot honor them has to give up.
    pub const MUST_HONOR: u64 = ACCESS_PLATFORM;
}

/// VirtIO device IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Network,
    Block,
    Console,
    Entropy,
    Balloon,
    Scsi,
    Gpu,
    Input,
    Vsock,
    Crypto,
    Sound,
    Unknown(u32),
}

impl DeviceType {
    /// Map a raw device id; 0 is reserved and means an empty slot
    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            0 => return None,
            1 => DeviceType::Network,
            2 => DeviceType::Block,
            3 => DeviceType::Console,
            4 => DeviceType::Entropy,
            5 => DeviceType::Balloon,
            8 => DeviceType::Scsi,
            16 => DeviceType::Gpu,
            18 => DeviceType::Input,
            19 => DeviceType::Vsock,
            20 => DeviceType::Crypto,
            25 => DeviceType::Sound,
            other => DeviceType::Unknown(other),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Network => "network",
            DeviceType::Block => "block",
            DeviceType::Console => "console",
            DeviceType::Entropy => "entropy",
            DeviceType::Balloon => "balloon",
            DeviceType::Scsi => "SCSI",
            DeviceType::Gpu => "GPU",
            DeviceType::Input => "input",
            DeviceType::Vsock => "vsock",
            DeviceType::Crypto => "crypto",
            DeviceType::Sound => "sound",
            DeviceType::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// No virtio signature at the probed address
    NoDevice,
    /// Transport version other than 1 (legacy) or 2 (modern)
    UnsupportedVersion(u32),
    /// Driver bound to the wrong device class
    WrongDeviceType(u32),
    /// Device offered something we must honor but can't, or refused FEATURES_OK
    FeatureMismatch(u64),
    /// Queue missing, already live, or too small
    QueueUnavailable(u16),
    /// DMA pool has no room
    DmaExhausted,
    /// Free descriptor list is empty
    DescriptorsExhausted,
    /// Chain does not match its buffers, or the device returned a bogus id
    InvalidChain,
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioError::NoDevice => write!(f, "no device"),
            VirtioError::UnsupportedVersion(v) => write!(f, "unsupported transport version {}", v),
            VirtioError::WrongDeviceType(id) => write!(f, "unexpected device id {}", id),
            VirtioError::FeatureMismatch(bits) => write!(f, "feature negotiation failed ({:#x})", bits),
            VirtioError::QueueUnavailable(q) => write!(f, "virtqueue {} unavailable", q),
            VirtioError::DmaExhausted => write!(f, "out of DMA memory"),
            VirtioError::DescriptorsExhausted => write!(f, "no free descriptors"),
            VirtioError::InvalidChain => write!(f, "malformed descriptor chain"),
        }
    }
}

impl From<VirtioError> for Errno {
    fn from(e: VirtioError) -> Self {
        match e {
            VirtioError::DmaExhausted | VirtioError::DescriptorsExhausted => Errno::ENOMEM,
            VirtioError::NoDevice
            | VirtioError::UnsupportedVersion(_)
            | VirtioError::WrongDeviceType(_) => Errno::ENODEV,
            VirtioError::InvalidChain => Errno::EINVAL,
            VirtioError::FeatureMismatch(_) | VirtioError::QueueUnavailable(_) => Errno::EIO,
        }
    }
}

/// Physical addresses of one split virtqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub size: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

/// Register-level access to a virtio device
pub trait Transport: Send + Sync {
    /// Raw device id (0 = empty slot)
    fn device_id(&self) -> u32;

    /// Transport version: 1 = legacy, 2 = modern
    fn version(&self) -> u32;

    fn read_status(&self) -> DeviceStatus;

    fn write_status(&self, status: DeviceStatus);

    fn read_device_features(&self) -> u64;

    fn write_driver_features(&self, features: u64);

    /// Largest size the device supports for `queue`, 0 if it doesn't exist
    fn max_queue_size(&self, queue: u16) -> u16;

    /// Whether `queue` has already been set up
    fn queue_in_use(&self, queue: u16) -> bool;

    /// Give the device the queue's ring addresses and enable it
    fn setup_queue(&self, queue: u16, layout: &QueueLayout);

    /// Doorbell
    fn notify(&self, queue: u16);

    fn read_config_u32(&self, offset: usize) -> u32;

    fn read_config_u64(&self, offset: usize) -> u64 {
        let low = self.read_config_u32(offset) as u64;
        let high = self.read_config_u32(offset + 4) as u64;
        (high << 32) | low
    }

    fn device_type(&self) -> Option<DeviceType> {
        DeviceType::from_id(self.device_id())
    }

    /// Write 0 to status and wait for the device to acknowledge it
    fn reset(&self) {
        self.write_status(DeviceStatus::empty());
        for _ in 0..1000 {
            if self.read_status().is_empty() {
                break;
            }
            core::hint::spin_loop();
        }
    }

    fn driver_ok(&self) {
        self.write_status(self.read_status() | DeviceStatus::DRIVER_OK);
    }
}

/// Steps 1-4 of the initialization sequence
///
/// Accepts `offered & supported` and returns it. Gives up (leaving FAILED
/// set) when the device insists on something in [`features::MUST_HONOR`]
/// that the driver did not list, when a modern device does not offer
/// VERSION_1, or when the device clears FEATURES_OK.
pub fn negotiate<T: Transport + ?Sized>(transport: &T, supported: u64) -> Result<u64, VirtioError> {
    transport.reset();
    transport.write_status(DeviceStatus::ACKNOWLEDGE);
    transport.write_status(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);

    let offered = transport.read_device_features();
    let unhonored = offered & features::MUST_HONOR & !supported;
    let missing_v1 = transport.version() >= 2 && offered & features::VERSION_1 == 0;
    if unhonored != 0 || missing_v1 {
        log::warn!(
            "virtio: device {} offers {:#x}, cannot honor {:#x}{}",
            transport.device_id(),
            offered,
            unhonored,
            if missing_v1 { " (modern device without VERSION_1)" } else { "" }
        );
        transport.write_status(DeviceStatus::FAILED);
        return Err(VirtioError::FeatureMismatch(unhonored | if missing_v1 { features::VERSION_1 } else { 0 }));
    }

    let negotiated = offered & supported;
    transport.write_driver_features(negotiated);

    let status = DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::FEATURES_OK;
    transport.write_status(status);
    if !transport.read_status().contains(DeviceStatus::FEATURES_OK) {
        transport.write_status(DeviceStatus::FAILED);
        return Err(VirtioError::FeatureMismatch(negotiated));
    }

    log::debug!("virtio: offered {:#x}, negotiated {:#x}", offered, negotiated);
    Ok(negotiated)
}
