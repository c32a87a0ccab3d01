//! Platform support shared by the USB host stack.
//!
//! The stack never maps memory itself. Everything physically-stable it hands
//! to a host controller is obtained through the [`dma::DmaMapper`] contract
//! and carved into transfer-sized pieces by the chunk pool in [`pool`].

pub mod dma;
pub mod pool;
pub mod timeout;

pub use dma::{DmaError, DmaMapper, DmaRegion, HeapMapper, MemoryType, PAGE_SIZE};
pub use pool::{DmaChunk, DmaPool, CHUNK_GRANULARITY, MAX_POOL_ALLOC};
pub use timeout::Timeout;
