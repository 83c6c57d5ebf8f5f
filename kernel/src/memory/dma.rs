//! DMA buffer pool
//!
//! Devices see physical addresses, so virtqueue rings, request headers and
//! bounce buffers are carved out of one physically contiguous region handed
//! over at boot. The region is managed by a first-fit
//! [`linked_list_allocator::Heap`]; every allocation is zeroed and released
//! when its [`DmaBuffer`] is dropped.

use crate::drivers::virtio::VirtioError;
use alloc::sync::Arc;
use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use core::slice;
use linked_list_allocator::Heap;
use spin::Mutex;

pub struct DmaPool {
    heap: Mutex<Heap>,
    virt_base: usize,
    phys_base: u64,
    size: usize,
}

impl DmaPool {
    /// Hand a region to the pool
    ///
    /// # Safety
    ///
    /// `virt..virt + size` must be mapped, exclusively owned by the pool for
    /// its whole lifetime, and backed by physically contiguous memory that
    /// starts at `phys_base`.
    pub unsafe fn new(virt: *mut u8, size: usize, phys_base: u64) -> Self {
        let mut heap = Heap::empty();
        heap.init(virt, size);
        log::debug!(
            "dma: pool at {:#x} (phys {:#x}), {} KiB",
            virt as usize,
            phys_base,
            size / 1024
        );
        Self {
            heap: Mutex::new(heap),
            virt_base: virt as usize,
            phys_base,
            size,
        }
    }

    /// Allocate a zeroed buffer
    pub fn alloc(self: &Arc<Self>, size: usize, align: usize) -> Result<DmaBuffer, VirtioError> {
        let layout = Layout::from_size_align(size.max(1), align).map_err(|_| VirtioError::DmaExhausted)?;
        let ptr = self
            .heap
            .lock()
            .allocate_first_fit(layout)
            .map_err(|_| VirtioError::DmaExhausted)?;
        // SAFETY: freshly allocated, `layout.size()` bytes, owned by us
        unsafe { ptr.as_ptr().write_bytes(0, layout.size()) };
        Ok(DmaBuffer {
            pool: self.clone(),
            ptr,
            layout,
        })
    }

    /// Physical address of a pointer inside the pool
    pub fn virt_to_phys(&self, addr: usize) -> u64 {
        debug_assert!(addr >= self.virt_base && addr < self.virt_base + self.size);
        self.phys_base + (addr - self.virt_base) as u64
    }

    pub fn free_bytes(&self) -> usize {
        self.heap.lock().free()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Zeroed, physically contiguous allocation from a [`DmaPool`]
pub struct DmaBuffer {
    pool: Arc<DmaPool>,
    ptr: NonNull<u8>,
    layout: Layout,
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &format_args!("{:#x}", self.ptr.as_ptr() as usize))
            .field("phys", &format_args!("{:#x}", self.phys_addr()))
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: the buffer is uniquely owned; sharing with the device is
// coordinated through the virtqueue protocol.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Address the device uses for this buffer
    pub fn phys_addr(&self) -> u64 {
        self.pool.virt_to_phys(self.ptr.as_ptr() as usize)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: valid for `len` bytes while `self` is alive
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: valid for `len` bytes and uniquely borrowed
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from this heap with this layout
        unsafe { self.pool.heap.lock().deallocate(self.ptr, self.layout) };
    }
}
