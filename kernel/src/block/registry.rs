//! Block device registry
//!
//! Name -> device directory. The registry holds the owning `Arc` for every
//! device; partition devices only keep a weak reference to their parent, so
//! the parent staying registered is what keeps a partition usable.

use super::{BlockDevice, BlockError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

pub struct BlockDeviceRegistry {
    devices: RwLock<Vec<Arc<BlockDevice>>>,
}

impl BlockDeviceRegistry {
    pub const fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Register a device and return the canonical shared handle
    ///
    /// Fails with [`BlockError::AlreadyExists`] if the name or the
    /// major:minor pair is taken.
    pub fn register(&self, device: BlockDevice) -> Result<Arc<BlockDevice>, BlockError> {
        let mut devices = self.devices.write();
        if devices
            .iter()
            .any(|d| d.name() == device.name() || d.id() == device.id())
        {
            log::warn!(
                "block: refusing duplicate registration of {} ({})",
                device.name(),
                device.id()
            );
            return Err(BlockError::AlreadyExists);
        }

        let device = Arc::new(device);
        log::info!(
            "block: registered {} ({}) {} sectors{}",
            device.name(),
            device.id(),
            device.capacity_sectors(),
            if device.is_partition() { " [partition]" } else { "" }
        );
        devices.push(device.clone());
        Ok(device)
    }

    /// Find a device by name
    pub fn lookup(&self, name: &str) -> Result<Arc<BlockDevice>, BlockError> {
        self.devices
            .read()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
            .ok_or(BlockError::NotFound)
    }

    /// Snapshot of all registered devices in registration order
    pub fn list(&self) -> Vec<Arc<BlockDevice>> {
        self.devices.read().clone()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

impl Default for BlockDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
