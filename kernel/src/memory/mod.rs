//! Memory helpers for device drivers and the block cache

pub mod dma;
pub mod page_cache;

pub use dma::{DmaBuffer, DmaPool};
pub use page_cache::{BufferHandle, BufferHead, CacheStats, PageCache};
