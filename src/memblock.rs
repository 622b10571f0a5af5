//! Reference-counted audio buffers and the shared usage accounting that
//! travels with them.
//!
//! The accounting counters are shared between the context, the framing
//! layer, and every stream; they stay meaningful for as long as any
//! block charged against them is alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

#[derive(Debug, Default)]
struct StatInner {
    total: AtomicUsize,
    total_size: AtomicUsize,
    allocated: AtomicUsize,
    allocated_size: AtomicUsize,
}

/// Shared memory-block accounting counters.
#[derive(Debug, Clone, Default)]
pub struct MemblockStat {
    inner: Arc<StatInner>,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemblockStatSnapshot {
    /// Blocks ever accounted.
    pub total: usize,
    /// Bytes ever accounted.
    pub total_size: usize,
    /// Blocks currently alive.
    pub allocated: usize,
    /// Bytes currently alive.
    pub allocated_size: usize,
}

impl MemblockStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MemblockStatSnapshot {
        MemblockStatSnapshot {
            total: self.inner.total.load(Ordering::Relaxed),
            total_size: self.inner.total_size.load(Ordering::Relaxed),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            allocated_size: self.inner.allocated_size.load(Ordering::Relaxed),
        }
    }

    fn charge(&self, size: usize) {
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        self.inner.total_size.fetch_add(size, Ordering::Relaxed);
        self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        self.inner.allocated_size.fetch_add(size, Ordering::Relaxed);
    }

    fn release(&self, size: usize) {
        self.inner.allocated.fetch_sub(1, Ordering::Relaxed);
        self.inner.allocated_size.fetch_sub(size, Ordering::Relaxed);
    }
}

/// One audio buffer, charged against a [`MemblockStat`] for its lifetime.
#[derive(Debug)]
pub struct Memblock {
    data: Bytes,
    stat: MemblockStat,
}

impl Memblock {
    pub fn new(data: Bytes, stat: &MemblockStat) -> Self {
        stat.charge(data.len());
        Self {
            data,
            stat: stat.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Cheap handle onto the underlying storage for the framer.
    pub(crate) fn bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl Drop for Memblock {
    fn drop(&mut self) {
        self.stat.release(self.data.len());
    }
}

/// A view into part of a [`Memblock`].
///
/// Chunks are handed to record read callbacks by reference; the backing
/// block is released when the delivery returns, so consumers must copy
/// what they need before returning.
#[derive(Debug)]
pub struct Chunk {
    block: Memblock,
    index: usize,
    length: usize,
}

impl Chunk {
    pub fn new(block: Memblock, index: usize, length: usize) -> Self {
        debug_assert!(index + length <= block.len());
        Self { block, index, length }
    }

    /// Wraps a whole block.
    pub fn from_block(block: Memblock) -> Self {
        let length = block.len();
        Self { block, index: 0, length }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block.as_slice()[self.index..self.index + self.length]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_follows_block_lifetime() {
        let stat = MemblockStat::new();
        let block = Memblock::new(Bytes::from_static(&[0u8; 64]), &stat);
        let snap = stat.snapshot();
        assert_eq!(snap.allocated, 1);
        assert_eq!(snap.allocated_size, 64);
        assert_eq!(snap.total, 1);

        drop(block);
        let snap = stat.snapshot();
        assert_eq!(snap.allocated, 0);
        assert_eq!(snap.allocated_size, 0);
        // Historical counters never go backwards.
        assert_eq!(snap.total, 1);
        assert_eq!(snap.total_size, 64);
    }

    #[test]
    fn stat_survives_its_creator() {
        let stat = MemblockStat::new();
        let block = {
            let shared = stat.clone();
            Memblock::new(Bytes::from_static(b"abc"), &shared)
        };
        assert_eq!(stat.snapshot().allocated, 1);
        drop(block);
        assert_eq!(stat.snapshot().allocated, 0);
    }

    #[test]
    fn chunk_views_a_slice_of_the_block() {
        let stat = MemblockStat::new();
        let block = Memblock::new(Bytes::from_static(b"0123456789"), &stat);
        let chunk = Chunk::new(block, 2, 5);
        assert_eq!(chunk.as_slice(), b"23456");
        assert_eq!(chunk.len(), 5);
    }
}
