//! Staged block requests
//!
//! A FIFO of whole-sector requests. Requests are executed synchronously, in
//! submission order, when the queue is drained. The page cache stages its
//! sync write-backs here.

use super::{BlockDevice, BlockError};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
}

/// One request against one device
///
/// For reads `buffer` receives the data; for writes it holds it.
pub struct BlockRequest {
    pub device: Arc<BlockDevice>,
    pub op: BlockOp,
    pub lba: u64,
    pub buffer: Vec<u8>,
}

impl BlockRequest {
    pub fn new_read(device: Arc<BlockDevice>, lba: u64, sectors: usize) -> Self {
        let len = sectors * device.sector_size();
        Self {
            device,
            op: BlockOp::Read,
            lba,
            buffer: vec![0; len],
        }
    }

    pub fn new_write(device: Arc<BlockDevice>, lba: u64, buffer: Vec<u8>) -> Self {
        Self {
            device,
            op: BlockOp::Write,
            lba,
            buffer,
        }
    }

    pub fn new_flush(device: Arc<BlockDevice>) -> Self {
        Self {
            device,
            op: BlockOp::Flush,
            lba: 0,
            buffer: Vec::new(),
        }
    }

    /// Run the request against its device
    pub fn execute(&mut self) -> Result<(), BlockError> {
        match self.op {
            BlockOp::Read => self.device.read_sectors(self.lba, &mut self.buffer),
            BlockOp::Write => self.device.write_sectors(self.lba, &self.buffer),
            BlockOp::Flush => self.device.flush(),
        }
    }
}

pub struct RequestQueue {
    pending: Mutex<VecDeque<BlockRequest>>,
}

impl RequestQueue {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn submit(&self, request: BlockRequest) {
        self.pending.lock().push_back(request);
    }

    pub fn pop(&self) -> Option<BlockRequest> {
        self.pending.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Execute every pending request in order, handing each to `complete`
    ///
    /// The queue lock is not held while a request runs, so completions may
    /// submit follow-up requests. Returns the number of requests processed.
    pub fn drain<F>(&self, mut complete: F) -> usize
    where
        F: FnMut(BlockRequest, Result<(), BlockError>),
    {
        let mut processed = 0;
        while let Some(mut request) = self.pop() {
            let result = request.execute();
            if let Err(e) = result {
                log::debug!(
                    "block: {:?} on {} at lba {} failed: {}",
                    request.op,
                    request.device.name(),
                    request.lba,
                    e
                );
            }
            complete(request, result);
            processed += 1;
        }
        processed
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
