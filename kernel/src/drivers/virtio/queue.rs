//! Split Virtqueue
//!
//! # Memory Layout
//!
//! One DMA allocation holds all three parts:
//! 1. Descriptor table - `size` x 16 bytes, at offset 0
//! 2. Available ring - driver writes, device reads
//! 3. Used ring - device writes, driver reads, on the next 4 KiB boundary
//!
//! The 4 KiB alignment of the used ring is what legacy devices assume when
//! they are only given the page number of the descriptor table.
//!
//! # Descriptor bookkeeping
//!
//! Descriptors are an index arena. Free indices sit on a stack preallocated
//! to the queue size; chain links are mirrored in driver-private memory so
//! releasing a chain never trusts what the device can see. Every index is in
//! exactly one state: free, allocated (chain built, not yet published) or in
//! flight.

use super::{QueueLayout, Transport, VirtioError};
use crate::memory::{DmaBuffer, DmaPool};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};

/// Descriptor flags
pub mod desc_flags {
    /// Buffer continues via the next field
    pub const NEXT: u16 = 1;
    /// Buffer is write-only (for device)
    pub const WRITE: u16 = 2;
    /// Buffer holds a table of indirect descriptors
    pub const INDIRECT: u16 = 4;
}

/// Largest queue a split ring can describe
pub const MAX_QUEUE_SIZE: u16 = 32768;

const USED_RING_ALIGN: usize = 4096;

/// Virtqueue descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    /// Physical address of the buffer
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    /// Index of next descriptor if NEXT flag is set
    pub next: u16,
}

/// Used ring element
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    /// Head index of the completed chain
    pub id: u32,
    /// Bytes the device wrote into the chain
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescState {
    Free,
    Allocated,
    InFlight,
}

/// An allocated, unpublished descriptor chain
///
/// Consumed by [`Virtqueue::submit`] or handed back with
/// [`Virtqueue::release_chain`].
#[derive(Debug, PartialEq, Eq)]
pub struct Chain {
    head: u16,
    len: u16,
}

impl Chain {
    pub fn head(&self) -> u16 {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One buffer of a request
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
    /// Device writes into this buffer
    pub device_writable: bool,
}

impl Segment {
    pub fn readable(addr: u64, len: u32) -> Self {
        Self { addr, len, device_writable: false }
    }

    pub fn writable(addr: u64, len: u32) -> Self {
        Self { addr, len, device_writable: true }
    }
}

/// Completion returned by [`Virtqueue::poll_used`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub head: u16,
    pub written: u32,
}

/// Byte offsets of the avail and used rings and the total size
pub const fn ring_layout(size: u16) -> (usize, usize, usize) {
    let n = size as usize;
    let avail = 16 * n;
    // flags + idx + ring[n] + used_event
    let avail_end = avail + 6 + 2 * n;
    let used = (avail_end + USED_RING_ALIGN - 1) / USED_RING_ALIGN * USED_RING_ALIGN;
    // flags + idx + ring[n] + avail_event
    let total = used + 6 + 8 * n;
    (avail, used, total)
}

pub struct Virtqueue {
    index: u16,
    size: u16,
    mem: DmaBuffer,
    avail_off: usize,
    used_off: usize,
    free: Vec<u16>,
    state: Vec<DescState>,
    /// Driver-private copy of chain links
    links: Vec<u16>,
    /// Chain length, recorded at the head while in flight
    chain_len: Vec<u16>,
    /// Shadow of avail.idx
    avail_idx: u16,
    last_used_idx: u16,
}

// SAFETY: the ring memory is owned by `mem`; callers serialize access
// through `&mut self`.
unsafe impl Send for Virtqueue {}
unsafe impl Sync for Virtqueue {}

impl Virtqueue {
    /// Allocate a zeroed queue of `size` descriptors from `dma`
    pub fn new(dma: &Arc<DmaPool>, index: u16, size: u16) -> Result<Self, VirtioError> {
        if size == 0 || size > MAX_QUEUE_SIZE || !size.is_power_of_two() {
            return Err(VirtioError::QueueUnavailable(index));
        }

        let (avail_off, used_off, total) = ring_layout(size);
        let mem = dma.alloc(total, USED_RING_ALIGN)?;
        let n = size as usize;

        log::debug!(
            "virtqueue {}: {} entries, desc={:#x} avail=+{:#x} used=+{:#x}",
            index,
            size,
            mem.phys_addr(),
            avail_off,
            used_off
        );

        Ok(Self {
            index,
            size,
            mem,
            avail_off,
            used_off,
            // Popped from the back: hand out 0, 1, 2, ... first
            free: (0..size).rev().collect(),
            state: vec![DescState::Free; n],
            links: vec![0; n],
            chain_len: vec![0; n],
            avail_idx: 0,
            last_used_idx: 0,
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Ring addresses for the transport
    pub fn layout(&self) -> QueueLayout {
        let base = self.mem.phys_addr();
        QueueLayout {
            size: self.size,
            desc: base,
            avail: base + self.avail_off as u64,
            used: base + self.used_off as u64,
        }
    }

    fn desc_ptr(&self, i: u16) -> *mut VirtqDesc {
        debug_assert!(i < self.size);
        // SAFETY: in bounds of the descriptor table
        unsafe { (self.mem.as_ptr() as *mut VirtqDesc).add(i as usize) }
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        // SAFETY: avail ring lies inside `mem`
        unsafe { self.mem.as_ptr().add(self.avail_off + 2) as *mut u16 }
    }

    fn avail_ring_ptr(&self, slot: u16) -> *mut u16 {
        // SAFETY: slot < size
        unsafe { (self.mem.as_ptr().add(self.avail_off + 4) as *mut u16).add((slot % self.size) as usize) }
    }

    fn used_idx_ptr(&self) -> *const u16 {
        // SAFETY: used ring lies inside `mem`
        unsafe { self.mem.as_ptr().add(self.used_off + 2) as *const u16 }
    }

    fn used_elem_ptr(&self, slot: u16) -> *const VirtqUsedElem {
        // SAFETY: slot < size
        unsafe {
            (self.mem.as_ptr().add(self.used_off + 4) as *const VirtqUsedElem).add((slot % self.size) as usize)
        }
    }

    /// Take `n` descriptors off the free stack and link them
    pub fn allocate_chain(&mut self, n: usize) -> Result<Chain, VirtioError> {
        if n == 0 || n > self.size as usize {
            return Err(VirtioError::InvalidChain);
        }
        if n > self.free.len() {
            return Err(VirtioError::DescriptorsExhausted);
        }

        let start = self.free.len() - n;
        let taken = self.free.split_off(start);
        // split_off keeps stack order; the last element was on top
        let mut indices = taken.iter().rev().copied();
        let head = indices.next().ok_or(VirtioError::InvalidChain)?;

        let mut prev = head;
        self.state[head as usize] = DescState::Allocated;
        for idx in indices {
            self.links[prev as usize] = idx;
            self.state[idx as usize] = DescState::Allocated;
            prev = idx;
        }
        self.links[prev as usize] = head;

        Ok(Chain { head, len: n as u16 })
    }

    /// Return an unsubmitted chain to the free list
    pub fn release_chain(&mut self, chain: Chain) {
        let mut idx = chain.head;
        for _ in 0..chain.len {
            debug_assert_eq!(self.state[idx as usize], DescState::Allocated);
            self.state[idx as usize] = DescState::Free;
            self.free.push(idx);
            idx = self.links[idx as usize];
        }
    }

    /// Fill in the chain's descriptors, publish it and ring the doorbell
    ///
    /// `segments` must match the chain length one to one. Returns the head
    /// index the device will report on completion.
    pub fn submit<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        chain: Chain,
        segments: &[Segment],
    ) -> Result<u16, VirtioError> {
        if segments.len() != chain.len() {
            self.release_chain(chain);
            return Err(VirtioError::InvalidChain);
        }

        let mut idx = chain.head;
        for (i, seg) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            let next = self.links[idx as usize];
            let flags = if seg.device_writable { desc_flags::WRITE } else { 0 }
                | if last { 0 } else { desc_flags::NEXT };
            // SAFETY: idx < size; descriptor memory is driver-owned until published
            unsafe {
                write_volatile(
                    self.desc_ptr(idx),
                    VirtqDesc {
                        addr: seg.addr,
                        len: seg.len,
                        flags,
                        next: if last { 0 } else { next },
                    },
                );
            }
            self.state[idx as usize] = DescState::InFlight;
            idx = next;
        }
        self.chain_len[chain.head as usize] = chain.len;

        // Descriptors must be visible before the ring entry that names them
        fence(Ordering::SeqCst);
        // SAFETY: ring pointers are in bounds
        unsafe {
            write_volatile(self.avail_ring_ptr(self.avail_idx), chain.head);
        }
        fence(Ordering::SeqCst);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        // SAFETY: the avail header lies inside the ring allocation
        unsafe {
            write_volatile(self.avail_idx_ptr(), self.avail_idx);
        }
        fence(Ordering::SeqCst);

        transport.notify(self.index);
        Ok(chain.head)
    }

    /// Whether the device has completed something we haven't consumed
    pub fn has_used(&self) -> bool {
        fence(Ordering::SeqCst);
        // SAFETY: in bounds, device-written
        unsafe { read_volatile(self.used_idx_ptr()) != self.last_used_idx }
    }

    /// Spin until the device completes a chain, then free it
    ///
    /// There is no timeout: a device that never answers stalls the caller.
    pub fn poll_used(&mut self) -> Result<Completion, VirtioError> {
        while !self.has_used() {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);

        // SAFETY: in bounds, device finished writing it before bumping idx
        let elem = unsafe { read_volatile(self.used_elem_ptr(self.last_used_idx)) };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        let head = elem.id;
        if head >= self.size as u32 || self.state[head as usize] != DescState::InFlight || self.chain_len[head as usize] == 0 {
            log::error!("virtqueue {}: device completed bogus head {}", self.index, head);
            return Err(VirtioError::InvalidChain);
        }

        let head = head as u16;
        let mut idx = head;
        for _ in 0..self.chain_len[head as usize] {
            self.state[idx as usize] = DescState::Free;
            self.free.push(idx);
            idx = self.links[idx as usize];
        }
        self.chain_len[head as usize] = 0;

        Ok(Completion { head, written: elem.len })
    }

    /// Dump a chain's descriptors at debug level
    pub fn debug_dump_chain(&self, head: u16) {
        let mut idx = head;
        for _ in 0..self.size {
            // SAFETY: idx < size
            let desc = unsafe { read_volatile(self.desc_ptr(idx)) };
            log::debug!(
                "virtqueue {}: desc[{}] addr={:#x} len={} flags={:#x} next={}",
                self.index,
                idx,
                desc.addr,
                desc.len,
                desc.flags,
                desc.next
            );
            if desc.flags & desc_flags::NEXT == 0 {
                break;
            }
            idx = desc.next;
        }
    }
}
