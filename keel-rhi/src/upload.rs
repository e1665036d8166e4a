//! Per-slot transient upload arena.
//!
//! Each ring slot owns one persistently mapped staging buffer with a bump cursor. Data for
//! device-local resources is written into it by the CPU and copied on the GPU by the slot's
//! upload stream, which executes ahead of the frame's rendering. The cursor is reset only after the slot's fence wait,
//! which proves the GPU consumed the previous cycle's copies.

use thiserror::Error;

use crate::backend::RenderBackend;
use crate::RhiResult;

/// The arena has no room left for a request this cycle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transient arena full: requested {requested} bytes, {remaining} of {capacity} remaining")]
pub struct ArenaFull {
    pub requested: u64,
    pub remaining: u64,
    pub capacity: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaAllocation {
    pub offset: u64,
    pub size: u64,
}

impl ArenaAllocation {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Bump allocation bookkeeping, independent of the memory it describes.
#[derive(Debug, Clone)]
pub struct ArenaCursor {
    capacity: u64,
    alignment: u64,
    offset: u64,
    resets: u64,
}

impl ArenaCursor {
    pub fn new(capacity: u64, alignment: u64) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            capacity,
            alignment,
            offset: 0,
            resets: 0,
        }
    }

    pub fn allocate(&mut self, size: u64) -> Result<ArenaAllocation, ArenaFull> {
        let full = ArenaFull {
            requested: size,
            remaining: self.remaining(),
            capacity: self.capacity,
        };

        let aligned = self
            .offset
            .checked_add(self.alignment - 1)
            .map(|v| v & !(self.alignment - 1))
            .ok_or(full)?;
        let end = aligned.checked_add(size).ok_or(full)?;
        if end > self.capacity {
            return Err(full);
        }

        self.offset = end;
        Ok(ArenaAllocation { offset: aligned, size })
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.resets += 1;
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.offset)
    }

    /// How many times the cursor went back to zero.
    #[inline]
    pub fn resets(&self) -> u64 {
        self.resets
    }
}

/// Destination of a staged copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CopyTarget {
    Buffer { handle: crate::BufferHandle, dst_offset: u64 },
    Texture { handle: crate::TextureHandle },
}

pub struct TransientArena<B: RenderBackend> {
    staging: B::Staging,
    cursor: ArenaCursor,
}

impl<B: RenderBackend> TransientArena<B> {
    pub fn new(backend: &B, capacity: u64, alignment: u64) -> RhiResult<Self> {
        let staging = backend.create_staging(capacity)?;
        Ok(Self {
            staging,
            cursor: ArenaCursor::new(capacity, alignment),
        })
    }

    /// Reserve room for `data` and copy it into the mapped staging memory.
    pub fn push(&mut self, backend: &B, data: &[u8]) -> Result<ArenaAllocation, ArenaFull> {
        let allocation = self.cursor.allocate(data.len() as u64)?;
        backend.write_staging(&self.staging, allocation.offset, data);
        Ok(allocation)
    }

    #[inline]
    pub fn allocate(&mut self, size: u64) -> Result<ArenaAllocation, ArenaFull> {
        self.cursor.allocate(size)
    }

    #[inline]
    pub fn reset(&mut self) {
        self.cursor.reset();
    }

    #[inline]
    pub fn staging(&self) -> &B::Staging {
        &self.staging
    }

    #[inline]
    pub fn cursor(&self) -> &ArenaCursor {
        &self.cursor
    }

    pub fn destroy(self, backend: &B) {
        backend.destroy_staging(self.staging);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn aligns_every_allocation() {
        let mut cursor = ArenaCursor::new(4096, 256);
        let a = cursor.allocate(10).unwrap();
        let b = cursor.allocate(300).unwrap();
        let c = cursor.allocate(1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(c.offset, 768);
        assert_eq!(cursor.offset(), 769);
    }

    #[test]
    fn exact_fit_succeeds_and_overflow_reports_full() {
        let mut cursor = ArenaCursor::new(1024, 256);
        cursor.allocate(512).unwrap();
        let last = cursor.allocate(512).unwrap();
        assert_eq!(last.end(), 1024);

        let err = cursor.allocate(1).unwrap_err();
        assert_eq!(err.requested, 1);
        assert_eq!(err.remaining, 0);
        assert_eq!(err.capacity, 1024);
    }

    #[test]
    fn full_request_leaves_cursor_untouched() {
        let mut cursor = ArenaCursor::new(96 * 1024, 256);
        cursor.allocate(64 * 1024).unwrap();
        let before = cursor.offset();
        assert!(cursor.allocate(64 * 1024).is_err());
        assert_eq!(cursor.offset(), before);
        // A request that fits still succeeds afterwards.
        assert!(cursor.allocate(16 * 1024).is_ok());
    }

    #[test]
    fn huge_sizes_do_not_overflow() {
        let mut cursor = ArenaCursor::new(1024, 256);
        cursor.allocate(3).unwrap();
        assert!(cursor.allocate(u64::MAX).is_err());
    }

    #[test]
    fn reset_counts_and_rewinds() {
        let mut cursor = ArenaCursor::new(1024, 256);
        cursor.allocate(700).unwrap();
        cursor.reset();
        assert_eq!(cursor.offset(), 0);
        assert_eq!(cursor.resets(), 1);
        assert_eq!(cursor.allocate(700).unwrap().offset, 0);
    }

    #[test]
    fn random_allocations_never_overlap() {
        let mut rng = StdRng::seed_from_u64(0xa11e_0c8);
        let mut cursor = ArenaCursor::new(1 << 20, 256);

        for _cycle in 0..20 {
            let mut ranges: Vec<ArenaAllocation> = Vec::new();
            loop {
                let size = rng.gen_range(1..16 * 1024);
                match cursor.allocate(size) {
                    Ok(allocation) => {
                        assert_eq!(allocation.offset % 256, 0);
                        assert!(allocation.end() <= cursor.capacity());
                        if let Some(prev) = ranges.last() {
                            assert!(allocation.offset >= prev.end());
                        }
                        ranges.push(allocation);
                    }
                    Err(_) => break,
                }
            }
            assert!(!ranges.is_empty());
            cursor.reset();
        }
        assert_eq!(cursor.resets(), 20);
    }
}
