//! Sector buffer cache
//!
//! Caches single sectors of any registered block device, keyed by
//! `(DeviceId, sector)`, with LRU replacement. A [`BufferHandle`] pins its
//! buffer until dropped; pinned buffers are never evicted, and a dirty
//! buffer is written back before its slot is reused.
//!
//! The cache map and LRU order share one lock. Recency is a per-entry stamp
//! from a monotonic clock, indexed by a second map, so a hit costs two
//! `O(log n)` updates. Each buffer's bytes have
//! their own lock, and the dirty flag and pin count are atomics, so holders
//! of different buffers never contend.

use crate::block::{BlockDevice, BlockError, BlockRequest, DeviceId, RequestQueue};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard};

type CacheKey = (DeviceId, u64);

/// One cached sector
pub struct BufferHead {
    device: Arc<BlockDevice>,
    sector: u64,
    data: Mutex<Box<[u8]>>,
    dirty: AtomicBool,
    refcount: AtomicUsize,
}

impl BufferHead {
    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Write the buffer to its device if dirty
    ///
    /// The data lock is held across the write so a concurrent writer either
    /// lands before it (and is written) or re-marks the buffer afterwards.
    fn write_back(&self) -> Result<bool, BlockError> {
        let data = self.data.lock();
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.device.write_sectors(self.sector, &data)?;
        self.dirty.store(false, Ordering::Release);
        Ok(true)
    }

    /// Snapshot the bytes into a write request and clear the dirty flag
    ///
    /// A write through a handle after the snapshot marks the buffer dirty
    /// again, so it is picked up by the next sync.
    fn stage_write_back(&self) -> Option<BlockRequest> {
        let data = self.data.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(BlockRequest::new_write(self.device.clone(), self.sector, data.to_vec()))
    }
}

/// A pinned reference to a cached sector
///
/// Dropping the handle (or passing it to [`PageCache::put`]) unpins it.
pub struct BufferHandle {
    head: Arc<BufferHead>,
}

impl BufferHandle {
    pub fn sector(&self) -> u64 {
        self.head.sector
    }

    pub fn is_dirty(&self) -> bool {
        self.head.is_dirty()
    }

    /// Read access to the sector bytes
    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.head.data.lock()
    }

    /// Write access; marks the buffer dirty
    pub fn data_mut(&self) -> MutexGuard<'_, Box<[u8]>> {
        let guard = self.head.data.lock();
        self.head.dirty.store(true, Ordering::Release);
        guard
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.head.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_blocks: usize,
    pub max_blocks: usize,
    pub hits: u64,
    pub misses: u64,
    pub dirty: usize,
    /// Buffers with outstanding handles
    pub pinned: usize,
}

impl CacheStats {
    /// Hits as a percentage of lookups
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 * 100.0 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} blocks, {} dirty, {} pinned, {} hits / {} misses ({:.1}% hit rate)",
            self.cached_blocks,
            self.max_blocks,
            self.dirty,
            self.pinned,
            self.hits,
            self.misses,
            self.hit_rate()
        )
    }
}

struct CacheEntry {
    head: Arc<BufferHead>,
    /// Key of this entry in `CacheInner::lru`
    stamp: u64,
}

struct CacheInner {
    map: BTreeMap<CacheKey, CacheEntry>,
    /// Stamp to key, least recently used first
    lru: BTreeMap<u64, CacheKey>,
    clock: u64,
}

impl CacheInner {
    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, key: CacheKey, head: Arc<BufferHead>) {
        let stamp = self.next_stamp();
        self.lru.insert(stamp, key);
        self.map.insert(key, CacheEntry { head, stamp });
    }

    fn touch(&mut self, key: CacheKey) {
        let stamp = self.next_stamp();
        if let Some(entry) = self.map.get_mut(&key) {
            self.lru.remove(&entry.stamp);
            entry.stamp = stamp;
            self.lru.insert(stamp, key);
        }
    }

    fn remove(&mut self, key: CacheKey) {
        if let Some(entry) = self.map.remove(&key) {
            self.lru.remove(&entry.stamp);
        }
    }

    fn head(&self, key: &CacheKey) -> Option<&Arc<BufferHead>> {
        self.map.get(key).map(|e| &e.head)
    }
}

pub struct PageCache {
    inner: Mutex<CacheInner>,
    max_blocks: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageCache {
    pub fn new(max_blocks: usize) -> Self {
        let max_blocks = max_blocks.max(1);
        log::info!("page_cache: {} blocks", max_blocks);
        Self {
            inner: Mutex::new(CacheInner {
                map: BTreeMap::new(),
                lru: BTreeMap::new(),
                clock: 0,
            }),
            max_blocks,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Pin `sector` of `device`, reading it on a miss
    ///
    /// When the cache is full the least recently used unpinned buffer is
    /// evicted (after write-back if dirty). Fails with
    /// [`BlockError::CacheExhausted`] if every buffer is pinned.
    pub fn get(&self, device: &Arc<BlockDevice>, sector: u64) -> Result<BufferHandle, BlockError> {
        if sector >= device.capacity_sectors() {
            return Err(BlockError::OutOfBounds);
        }
        let key = (device.id(), sector);
        let mut inner = self.inner.lock();

        if let Some(head) = inner.head(&key).cloned() {
            head.refcount.fetch_add(1, Ordering::AcqRel);
            inner.touch(key);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(BufferHandle { head });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if inner.map.len() >= self.max_blocks {
            self.evict_one(&mut inner)?;
        }

        let mut data = vec![0u8; device.sector_size()].into_boxed_slice();
        device.read_sectors(sector, &mut data)?;

        let head = Arc::new(BufferHead {
            device: device.clone(),
            sector,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
            refcount: AtomicUsize::new(1),
        });
        inner.insert(key, head.clone());
        Ok(BufferHandle { head })
    }

    /// Unpin a buffer
    pub fn put(&self, handle: BufferHandle) {
        drop(handle);
    }

    fn evict_one(&self, inner: &mut CacheInner) -> Result<(), BlockError> {
        let victim = inner
            .lru
            .values()
            .copied()
            .find(|key| inner.head(key).is_some_and(|h| h.refcount() == 0));
        let Some(key) = victim else {
            log::warn!("page_cache: all {} buffers pinned", self.max_blocks);
            return Err(BlockError::CacheExhausted);
        };

        if let Some(head) = inner.head(&key) {
            if head.write_back()? {
                log::trace!("page_cache: wrote back {}:{} before eviction", key.0, key.1);
            }
        }
        inner.remove(key);
        Ok(())
    }

    /// Read `buf.len()` bytes starting at byte `offset` of `device`
    ///
    /// Goes through the cache one sector at a time; each buffer is unpinned
    /// as soon as it has been copied.
    pub fn read_bytes(&self, device: &Arc<BlockDevice>, offset: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let sector_size = device.sector_size() as u64;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let within = (pos % sector_size) as usize;
            let n = (sector_size as usize - within).min(buf.len() - done);
            let handle = self.get(device, pos / sector_size)?;
            buf[done..done + n].copy_from_slice(&handle.data()[within..within + n]);
            done += n;
        }
        Ok(())
    }

    fn dirty_buffers(&self, device: Option<DeviceId>) -> Vec<Arc<BufferHead>> {
        self.inner
            .lock()
            .map
            .iter()
            .filter(|(key, entry)| device.map_or(true, |id| key.0 == id) && entry.head.is_dirty())
            .map(|(_, entry)| entry.head.clone())
            .collect()
    }

    /// Write back dirty buffers, optionally for one device only
    ///
    /// The writes are staged on a [`RequestQueue`] and drained in order.
    /// Every buffer is attempted; the first error is returned. Buffers that
    /// failed stay dirty.
    fn sync(&self, device: Option<DeviceId>) -> Result<usize, BlockError> {
        let queue = RequestQueue::new();
        let mut staged = Vec::new();
        for head in self.dirty_buffers(device) {
            if let Some(request) = head.stage_write_back() {
                queue.submit(request);
                staged.push(head);
            }
        }

        let mut written = 0;
        let mut first_err = None;
        // Completions arrive in submission order
        let mut staged = staged.into_iter();
        queue.drain(|request, result| {
            let Some(head) = staged.next() else {
                return;
            };
            match result {
                Ok(()) => written += 1,
                Err(e) => {
                    head.dirty.store(true, Ordering::Release);
                    log::error!(
                        "page_cache: write-back of {} sector {} failed: {}",
                        request.device.name(),
                        request.lba,
                        e
                    );
                    first_err.get_or_insert(e);
                }
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Write back every dirty buffer; returns how many were written
    pub fn sync_all(&self) -> Result<usize, BlockError> {
        self.sync(None)
    }

    /// Write back the dirty buffers of one device
    pub fn sync_device(&self, device: &BlockDevice) -> Result<usize, BlockError> {
        self.sync(Some(device.id()))
    }

    /// Drop every buffer of `device`
    ///
    /// Fails with [`BlockError::Busy`] and changes nothing if any of them is
    /// pinned. Buffers still dirty are written back first.
    pub fn invalidate_device(&self, device: &BlockDevice) -> Result<usize, BlockError> {
        let id = device.id();
        let mut inner = self.inner.lock();
        let keys: Vec<CacheKey> = inner.map.range((id, 0)..=(id, u64::MAX)).map(|(k, _)| *k).collect();

        if keys.iter().any(|k| inner.head(k).is_some_and(|h| h.refcount() > 0)) {
            log::warn!("page_cache: {} still has pinned buffers", device.name());
            return Err(BlockError::Busy);
        }
        for key in &keys {
            if let Some(head) = inner.head(key) {
                head.write_back()?;
            }
        }
        for key in &keys {
            inner.remove(*key);
        }
        log::debug!("page_cache: dropped {} buffers of {}", keys.len(), device.name());
        Ok(keys.len())
    }

    /// Number of cached buffers belonging to `device`
    pub fn cached_for(&self, device: &BlockDevice) -> usize {
        let id = device.id();
        self.inner.lock().map.range((id, 0)..=(id, u64::MAX)).count()
    }

    pub fn contains(&self, device: &BlockDevice, sector: u64) -> bool {
        self.inner.lock().map.contains_key(&(device.id(), sector))
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            cached_blocks: inner.map.len(),
            max_blocks: self.max_blocks,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            dirty: inner.map.values().filter(|e| e.head.is_dirty()).count(),
            pinned: inner.map.values().filter(|e| e.head.refcount() > 0).count(),
        }
    }
}
