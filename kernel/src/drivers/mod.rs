//! Device drivers subsystem
//!
//! Only the storage path lives here: virtio transports and the virtio
//! block driver that feeds the block layer.

pub mod virtio;
