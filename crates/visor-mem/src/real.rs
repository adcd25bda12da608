//! Grow-on-demand physical backing pool with a frame-granular free list.
//!
//! The pool is one contiguous byte buffer. Frames are handed out by bump
//! allocation from `used`, and returned frames are tracked in a run-coalescing
//! free list that is consulted before bumping. Capacity grows by 1.5× up to a
//! fixed ceiling; growth may reallocate the buffer, which is why nothing in
//! this crate hands out borrowed views without holding the pool lock (see
//! [`crate::system::RamView`]).

use tracing::trace;

use crate::pte::{round_up_page, PAGE_SIZE};

/// Capacity after the first growth of an empty pool.
const INITIAL_CAPACITY: u64 = 0x10000;

/// Default pool ceiling when none is configured.
pub const DEFAULT_REAL_LIMIT: u64 = 1 << 32;

/// Frame accounting for one guest.
///
/// `allocated`, `reclaimed`, `freed`, `resizes` and `pagetables` are monotone
/// event counts; `committed` and `reserved` track current state. Page-table
/// frames count toward both `committed` and `pagetables`, so
/// `allocated + reclaimed == committed + freed` holds whenever no operation
/// is in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemStats {
    /// Frames bump-allocated from the end of the pool.
    pub allocated: u64,
    /// Frames appended to the free list.
    pub freed: u64,
    /// Frames popped back off the free list.
    pub reclaimed: u64,
    /// Times the pool buffer changed capacity.
    pub resizes: u64,
    /// Frames currently committed (data pages and page tables).
    pub committed: u64,
    /// Virtual pages currently reserved but not committed.
    pub reserved: u64,
    /// Page-table frames ever allocated.
    pub pagetables: u64,
}

/// A run of contiguous free frames. `start` and `len` are frame-aligned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRun {
    start: u64,
    len: u64,
}

/// The physical pool.
pub(crate) struct Real {
    buf: Vec<u8>,
    used: u64,
    limit: u64,
    /// Free runs, newest last; the tail element is the head run that
    /// allocation pops from and coalescing extends.
    free: Vec<FreeRun>,
    pub(crate) stats: MemStats,
}

impl Real {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            buf: Vec::new(),
            used: 0,
            limit: round_up_page(limit),
            free: Vec::new(),
            stats: MemStats::default(),
        }
    }

    #[inline]
    pub(crate) fn used(&self) -> u64 {
        self.used
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u64 {
        self.buf.len() as u64
    }

    #[inline]
    pub(crate) fn limit(&self) -> u64 {
        self.limit
    }

    /// Ensure capacity is at least `n` bytes (frame-rounded). Fails once the
    /// ceiling is reached.
    pub(crate) fn reserve(&mut self, n: u64) -> bool {
        let want = round_up_page(n);
        if want > self.limit {
            return false;
        }
        if want > self.capacity() {
            self.grow_to(want);
        }
        true
    }

    fn grow_to(&mut self, n: u64) {
        debug_assert!(n % PAGE_SIZE == 0 && n <= self.limit);
        trace!(from = self.capacity(), to = n, "pool resize");
        self.buf.resize(n as usize, 0);
        self.stats.resizes += 1;
    }

    /// Allocate one frame, preferring the free list. Returns its pool offset,
    /// or `None` when the pool is exhausted. The frame contents are whatever
    /// they last held.
    pub(crate) fn allocate_page_raw(&mut self) -> Option<u64> {
        if let Some(run) = self.free.last_mut() {
            debug_assert!(run.len >= PAGE_SIZE);
            debug_assert!(run.start % PAGE_SIZE == 0 && run.len % PAGE_SIZE == 0);
            debug_assert!(run.start + run.len <= self.used);
            let addr = run.start;
            run.start += PAGE_SIZE;
            run.len -= PAGE_SIZE;
            if run.len == 0 {
                self.free.pop();
            }
            self.stats.reclaimed += 1;
            self.stats.committed += 1;
            return Some(addr);
        }

        if self.used == self.capacity() {
            let want = if self.capacity() == 0 {
                INITIAL_CAPACITY
            } else {
                self.capacity() + self.capacity() / 2
            };
            let want = round_up_page(want).min(self.limit);
            if want <= self.used {
                return None;
            }
            self.grow_to(want);
        }

        debug_assert!(self.used % PAGE_SIZE == 0);
        let addr = self.used;
        self.used += PAGE_SIZE;
        self.stats.allocated += 1;
        self.stats.committed += 1;
        Some(addr)
    }

    /// Allocate one zeroed frame.
    pub(crate) fn allocate_page(&mut self) -> Option<u64> {
        let addr = self.allocate_page_raw()?;
        self.slice_mut(addr, PAGE_SIZE as usize).fill(0);
        Some(addr)
    }

    /// Return a frame to the free list, extending the head run when the frame
    /// is immediately contiguous with it.
    pub(crate) fn append_free(&mut self, addr: u64) {
        debug_assert!(addr % PAGE_SIZE == 0 && addr + PAGE_SIZE <= self.used);
        match self.free.last_mut() {
            Some(run) if addr == run.start + run.len => run.len += PAGE_SIZE,
            _ => self.free.push(FreeRun {
                start: addr,
                len: PAGE_SIZE,
            }),
        }
        self.stats.freed += 1;
    }

    /// Free runs as `(start, len)` pairs, head run last.
    pub(crate) fn free_runs(&self) -> Vec<(u64, u64)> {
        self.free.iter().map(|r| (r.start, r.len)).collect()
    }

    /// Drop the free list, rewind the bump pointer and zero the statistics.
    /// The buffer itself is kept at its current capacity.
    pub(crate) fn reset(&mut self) {
        self.free.clear();
        self.used = 0;
        self.stats = MemStats::default();
    }

    #[inline]
    pub(crate) fn slice(&self, off: u64, len: usize) -> &[u8] {
        let off = off as usize;
        &self.buf[off..off + len]
    }

    #[inline]
    pub(crate) fn slice_mut(&mut self, off: u64, len: usize) -> &mut [u8] {
        let off = off as usize;
        &mut self.buf[off..off + len]
    }

    /// 8-byte little-endian load, used for page-table entries.
    #[inline]
    pub(crate) fn load64(&self, off: u64) -> u64 {
        let b: [u8; 8] = self.slice(off, 8).try_into().unwrap();
        u64::from_le_bytes(b)
    }

    /// 8-byte little-endian store, used for page-table entries.
    #[inline]
    pub(crate) fn store64(&mut self, off: u64, value: u64) {
        self.slice_mut(off, 8).copy_from_slice(&value.to_le_bytes());
    }
}
