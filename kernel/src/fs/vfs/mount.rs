//! VFS Mount Point Management
//!
//! The mount table maps a target path to the filesystem instance mounted
//! there and the block device underneath it. Mounting resolves the source
//! through the block device registry and dispatches on the filesystem type
//! string; unmounting flushes and drops the device's cached blocks before
//! the instance is released.

use super::inode::InodeOps;
use crate::block::{BlockDevice, BlockDeviceRegistry};
use crate::error::{Errno, KResult};
use crate::fs::ext2::Ext2Fs;
use crate::memory::PageCache;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// Mount flags (Linux `MS_*` values)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const RDONLY = 1;
        const NOSUID = 2;
        const NODEV = 4;
        const NOEXEC = 8;
        const SYNCHRONOUS = 16;
        const REMOUNT = 32;
        const NOATIME = 1024;
        const NODIRATIME = 2048;
        const RELATIME = 1 << 21;
    }
}

/// Filesystem-wide statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    pub fs_type: &'static str,
    pub block_size: u64,
    pub blocks: u64,
    pub free_blocks: u64,
    /// Free blocks usable by unprivileged users
    pub available_blocks: u64,
    pub files: u64,
    pub free_files: u64,
    pub name_max: u32,
    pub volume_name: String,
}

/// A mounted filesystem instance
pub trait FileSystem: Send + Sync {
    fn fs_type(&self) -> &'static str;

    /// Block device the filesystem reads through
    fn device(&self) -> &Arc<BlockDevice>;

    fn root(&self) -> KResult<Arc<dyn InodeOps>>;

    fn statfs(&self) -> StatFs;

    /// Stop serving requests
    ///
    /// Afterwards every operation on the instance, and on inodes obtained
    /// from it, fails with `ENXIO` without touching the device.
    fn shutdown(&self);

    /// Undo [`shutdown`](Self::shutdown) after an unmount that did not
    /// complete
    fn resume(&self);
}

type MountFn = fn(Arc<BlockDevice>, Arc<PageCache>) -> KResult<Arc<dyn FileSystem>>;

fn mount_ext2(device: Arc<BlockDevice>, cache: Arc<PageCache>) -> KResult<Arc<dyn FileSystem>> {
    Ok(Ext2Fs::mount(device, cache)?)
}

/// Known filesystem types
const FILESYSTEMS: &[(&str, MountFn)] = &[("ext2", mount_ext2)];

struct Mount {
    target: String,
    source: String,
    flags: MountFlags,
    fs: Arc<dyn FileSystem>,
    root: Arc<dyn InodeOps>,
}

/// Snapshot of one mount, as returned by [`MountTable::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub target: String,
    pub source: String,
    pub fs_type: &'static str,
    pub flags: MountFlags,
}

pub struct MountTable {
    registry: Arc<BlockDeviceRegistry>,
    cache: Arc<PageCache>,
    mounts: Mutex<Vec<Mount>>,
}

/// Accept absolute paths only; drop a trailing slash
fn normalize_target(target: &str) -> KResult<&str> {
    if !target.starts_with('/') {
        return Err(Errno::EINVAL);
    }
    let trimmed = target.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/" } else { trimmed })
}

impl MountTable {
    pub fn new(registry: Arc<BlockDeviceRegistry>, cache: Arc<PageCache>) -> Self {
        Self {
            registry,
            cache,
            mounts: Mutex::new(Vec::new()),
        }
    }

    /// Mount `source` (a registry name, optionally prefixed with `/dev/`)
    /// at `target`
    ///
    /// # Arguments
    /// * `fstype` - filesystem type; only `"ext2"` is known
    /// * `flags` - raw `MS_*` bits; unknown bits are ignored and the mount is
    ///   always read-only
    /// * `data` - filesystem options, currently unused
    ///
    /// # Returns
    /// The root inode of the new mount. On failure nothing is recorded and
    /// the device's cached blocks are dropped again.
    pub fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: &str,
        flags: u32,
        data: Option<&str>,
    ) -> KResult<Arc<dyn InodeOps>> {
        let target = normalize_target(target)?;
        let mut flags = MountFlags::from_bits_truncate(flags);
        if !flags.contains(MountFlags::RDONLY) {
            log::debug!("vfs: {} mounted read-only", target);
            flags |= MountFlags::RDONLY;
        }
        if let Some(data) = data {
            log::debug!("vfs: ignoring mount options \"{}\"", data);
        }

        let mut mounts = self.mounts.lock();
        if mounts.iter().any(|m| m.target == target) {
            return Err(Errno::EBUSY);
        }

        let name = source.strip_prefix("/dev/").unwrap_or(source);
        let device = self.registry.lookup(name).map_err(|_| Errno::ENOENT)?;
        if mounts.iter().any(|m| m.fs.device().id() == device.id()) {
            log::warn!("vfs: {} is already mounted", name);
            return Err(Errno::EBUSY);
        }

        let ctor = FILESYSTEMS
            .iter()
            .find(|(known, _)| *known == fstype)
            .map(|(_, ctor)| *ctor)
            .ok_or(Errno::ENODEV)?;

        let mounted = ctor(device.clone(), self.cache.clone()).and_then(|fs| {
            let root = fs.root()?;
            Ok((fs, root))
        });
        let (fs, root) = match mounted {
            Ok(pair) => pair,
            Err(e) => {
                if let Err(inval) = self.cache.invalidate_device(&device) {
                    log::warn!("vfs: could not drop cached blocks of {}: {}", name, inval);
                }
                log::warn!("vfs: mount {} on {} as {} failed: {}", name, target, fstype, e);
                return Err(e);
            }
        };

        log::info!("vfs: mounted {} on {} ({}, {:?})", name, target, fstype, flags);
        mounts.push(Mount {
            target: target.to_string(),
            source: name.to_string(),
            flags,
            fs,
            root: root.clone(),
        });
        Ok(root)
    }

    /// Unmount whatever is mounted at `target`
    ///
    /// Dirty blocks of the device are written back, the filesystem is shut
    /// down and every cached block of the device is dropped before the mount
    /// is removed. Inodes still held by callers fail with `ENXIO` from then
    /// on. If any step fails the mount stays in place and keeps working.
    pub fn unmount(&self, target: &str) -> KResult<()> {
        let target = normalize_target(target)?;
        let mut mounts = self.mounts.lock();
        let pos = mounts.iter().position(|m| m.target == target).ok_or(Errno::EINVAL)?;
        let fs = mounts[pos].fs.clone();
        let device = fs.device().clone();

        let written = self.cache.sync_device(&device).map_err(|e| {
            log::error!("vfs: sync of {} failed: {}", device.name(), e);
            Errno::from(e)
        })?;
        if written > 0 {
            device.flush()?;
        }

        // Inodes handed out earlier must not refill the cache once it is dropped
        fs.shutdown();
        if let Err(e) = self.cache.invalidate_device(&device) {
            fs.resume();
            return Err(e.into());
        }

        let mount = mounts.remove(pos);
        log::info!("vfs: unmounted {} from {}", mount.source, mount.target);
        Ok(())
    }

    /// Root inode of the mount at `target`
    pub fn find(&self, target: &str) -> Option<Arc<dyn InodeOps>> {
        let target = normalize_target(target).ok()?;
        self.mounts.lock().iter().find(|m| m.target == target).map(|m| m.root.clone())
    }

    pub fn filesystem(&self, target: &str) -> Option<Arc<dyn FileSystem>> {
        let target = normalize_target(target).ok()?;
        self.mounts.lock().iter().find(|m| m.target == target).map(|m| m.fs.clone())
    }

    pub fn list(&self) -> Vec<MountInfo> {
        self.mounts
            .lock()
            .iter()
            .map(|m| MountInfo {
                target: m.target.clone(),
                source: m.source.clone(),
                fs_type: m.fs.fs_type(),
                flags: m.flags,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.mounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
