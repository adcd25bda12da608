//! The `System`: everything the machines of one guest share.
//!
//! This owns the physical pool, the page-table tree rooted at CR3, the
//! host-region arena and the memory statistics, all behind one reader-writer
//! lock. Walkers take the read side; reservation, commit, free, pool growth
//! and guest byte writes take the write side. Per-CPU state (TLB, stash,
//! access bookkeeping) lives in the machine crate.
//!
//! Addresses resolve to [`Phys`] values — `(storage, offset)` pairs — rather
//! than borrowed slices, so the pool is free to grow (and the lock to be
//! released) between resolution and the final copy. [`RamView`] is the one
//! exception: it pins the pool for the duration of a single operand access.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard, Weak};

use tracing::{debug, trace};

use crate::pte::{
    is_valid_virt, round_up_page, table_index, LEVEL_LEAF, LEVEL_ROOT, PAGE_SIZE, PTE_HOST,
    PTE_MAP, PTE_RSRV, PTE_TA, PTE_TABLE, PTE_V,
};
use crate::real::{MemStats, Real, DEFAULT_REAL_LIMIT};
use crate::MemError;

/// Resolved location of a guest byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phys {
    /// Offset into the physical pool.
    Ram(u64),
    /// Offset into the host-region arena.
    Host(u64),
}

impl Phys {
    /// The resolved location `n` bytes further on. Callers keep the result
    /// within the same page.
    #[inline]
    pub fn add(self, n: u64) -> Phys {
        match self {
            Phys::Ram(off) => Phys::Ram(off + n),
            Phys::Host(off) => Phys::Host(off + n),
        }
    }

    #[inline]
    pub fn offset(self) -> u64 {
        match self {
            Phys::Ram(off) | Phys::Host(off) => off,
        }
    }
}

/// Host-owned buffers surfaced to the guest through `PTE_HOST` leaves.
///
/// Each region is assigned a stable page-aligned handle in a private handle
/// space; a `HOST` leaf stores `handle + page offset` in its translation
/// address field, and projection walks back from the handle to the bytes.
struct HostArena {
    regions: Vec<HostRegion>,
    next: u64,
}

struct HostRegion {
    base: u64,
    bytes: Box<[u8]>,
}

impl HostArena {
    fn new() -> Self {
        Self {
            regions: Vec::new(),
            // Handle 0 stays invalid so a zeroed TA can never resolve.
            next: PAGE_SIZE,
        }
    }

    /// Register a region, padding it to a whole number of pages. Returns its
    /// handle.
    fn map(&mut self, bytes: Box<[u8]>) -> u64 {
        let mut padded = bytes.into_vec();
        padded.resize(round_up_page(padded.len() as u64) as usize, 0);
        let base = self.next;
        self.next = base + padded.len() as u64;
        self.regions.push(HostRegion {
            base,
            bytes: padded.into_boxed_slice(),
        });
        base
    }

    fn region_of(&self, off: u64) -> Option<(&HostRegion, usize)> {
        self.regions
            .iter()
            .find(|r| off >= r.base && off < r.base + r.bytes.len() as u64)
            .map(|r| (r, (off - r.base) as usize))
    }

    fn contains(&self, off: u64) -> bool {
        self.region_of(off).is_some()
    }

    fn slice(&self, off: u64, len: usize) -> &[u8] {
        let (region, inner) = self.region_of(off).expect("unregistered host offset");
        &region.bytes[inner..inner + len]
    }

    fn slice_mut(&mut self, off: u64, len: usize) -> &mut [u8] {
        let region = self
            .regions
            .iter_mut()
            .find(|r| off >= r.base && off < r.base + r.bytes.len() as u64)
            .expect("unregistered host offset");
        let inner = (off - region.base) as usize;
        &mut region.bytes[inner..inner + len]
    }
}

/// Lock-protected interior of a [`System`].
pub struct SysMem {
    real: Real,
    host: HostArena,
    /// Root page-table entry: the root frame offset with `PTE_TABLE` flags,
    /// so a root at pool offset 0 is distinguishable from "no address space".
    cr3: u64,
}

impl SysMem {
    fn new(limit: u64) -> Self {
        Self {
            real: Real::new(limit),
            host: HostArena::new(),
            cr3: 0,
        }
    }

    fn ensure_cr3(&mut self) -> Result<(), MemError> {
        if self.cr3 == 0 {
            let root = self.real.allocate_page().ok_or(MemError::OutOfMemory)?;
            self.cr3 = root | PTE_TABLE;
            debug!(root, "allocated address-space root");
        }
        Ok(())
    }

    /// Walk `virt` down to its leaf entry. Returns the leaf when it has
    /// either `PTE_V` or `PTE_RSRV`; `None` for an unmapped address or when
    /// no address space exists yet.
    fn walk(&self, virt: i64) -> Option<u64> {
        if self.cr3 == 0 {
            return None;
        }
        let mut entry = self.cr3;
        let mut level = LEVEL_ROOT;
        loop {
            let table = entry & PTE_TA;
            entry = self.real.load64(table + table_index(virt, level) * 8);
            if level == LEVEL_LEAF {
                break;
            }
            if entry & PTE_V == 0 {
                return None;
            }
            level -= 9;
        }
        if entry & (PTE_V | PTE_RSRV) == 0 {
            None
        } else {
            Some(entry)
        }
    }

    /// Commit a reserved leaf: allocate a zeroed frame and swap `PTE_RSRV`
    /// for `PTE_V` plus the frame address. Re-walks under the write lock so a
    /// racing commit on another machine is observed rather than clobbered.
    /// Returns the committed leaf, or `None` when the address is not mapped
    /// or the pool is exhausted.
    fn commit_page(&mut self, virt: i64) -> Option<u64> {
        if self.cr3 == 0 {
            return None;
        }
        let mut entry = self.cr3;
        let mut level = LEVEL_ROOT;
        let slot = loop {
            let table = entry & PTE_TA;
            let slot = table + table_index(virt, level) * 8;
            entry = self.real.load64(slot);
            if level == LEVEL_LEAF {
                break slot;
            }
            if entry & PTE_V == 0 {
                return None;
            }
            level -= 9;
        };
        if entry & PTE_V != 0 {
            // Another machine committed this page first.
            return Some(entry);
        }
        if entry & PTE_RSRV == 0 {
            return None;
        }
        let frame = self.real.allocate_page()?;
        self.real.stats.reserved -= 1;
        let committed =
            (frame & (PTE_TA | PTE_HOST | PTE_MAP)) | (entry & !(PTE_TA | PTE_RSRV)) | PTE_V;
        self.real.store64(slot, committed);
        trace!(virt, frame, "committed reserved page");
        Some(committed)
    }

    /// Walk to the leaf slot for `virt`, creating missing intermediate
    /// tables. Returns the pool offset of the leaf slot.
    fn ensure_leaf_slot(&mut self, virt: i64) -> Result<u64, MemError> {
        self.ensure_cr3()?;
        let mut entry = self.cr3;
        let mut level = LEVEL_ROOT;
        loop {
            let table = entry & PTE_TA;
            let slot = table + table_index(virt, level) * 8;
            if level == LEVEL_LEAF {
                return Ok(slot);
            }
            entry = self.real.load64(slot);
            if entry & PTE_V == 0 {
                let page = self.real.allocate_page().ok_or(MemError::OutOfMemory)?;
                entry = page | PTE_TABLE;
                self.real.store64(slot, entry);
                self.real.stats.pagetables += 1;
            }
            level -= 9;
        }
    }

    /// Reserve every absent leaf in `[virt, virt + size)` with `key`,
    /// creating intermediate tables on the way. Existing leaves (reserved or
    /// committed) are left untouched. Contiguous leaf slots are swept without
    /// re-walking, wrapping at the end of each table.
    fn reserve_virtual(&mut self, virt: i64, size: u64, key: u64) -> Result<(), MemError> {
        debug_assert!(key & PTE_V == 0, "reservation keys must not be valid");
        if size == 0 {
            return Ok(());
        }
        self.ensure_cr3()?;
        let end = virt + size as i64;
        let mut virt = virt;
        trace!(virt, size, key, "reserve virtual range");
        'descend: loop {
            let mut entry = self.cr3;
            let mut level = LEVEL_ROOT;
            loop {
                let table = entry & PTE_TA;
                let mut index = table_index(virt, level);
                let mut slot = table + index * 8;
                entry = self.real.load64(slot);
                if level > LEVEL_LEAF {
                    if entry & PTE_V == 0 {
                        let page = self.real.allocate_page().ok_or(MemError::OutOfMemory)?;
                        entry = page | PTE_TABLE;
                        self.real.store64(slot, entry);
                        self.real.stats.pagetables += 1;
                    }
                    level -= 9;
                    continue;
                }
                loop {
                    if entry & (PTE_V | PTE_RSRV) == 0 {
                        self.real.store64(slot, key);
                        self.real.stats.reserved += 1;
                    }
                    virt += PAGE_SIZE as i64;
                    if virt >= end {
                        return Ok(());
                    }
                    index += 1;
                    if index == 512 {
                        continue 'descend;
                    }
                    slot += 8;
                    entry = self.real.load64(slot);
                }
            }
        }
    }

    /// Scan upward from `hint` for a contiguous unmapped run of `size`
    /// bytes. Returns the start of the run.
    fn find_virtual(&self, hint: i64, size: u64) -> Result<i64, MemError> {
        let mut virt = hint;
        let mut start = hint;
        let mut got: u64 = 0;
        while got < size {
            if !is_valid_virt(virt) {
                return Err(MemError::OutOfMemory);
            }
            let absent_level = if self.cr3 == 0 {
                Some(LEVEL_ROOT)
            } else {
                let mut entry = self.cr3;
                let mut level = LEVEL_ROOT;
                loop {
                    let table = entry & PTE_TA;
                    entry = self.real.load64(table + table_index(virt, level) * 8);
                    if level == LEVEL_LEAF {
                        break if entry & (PTE_V | PTE_RSRV) == 0 {
                            Some(level)
                        } else {
                            None
                        };
                    }
                    if entry & PTE_V == 0 {
                        break Some(level);
                    }
                    level -= 9;
                }
            };
            match absent_level {
                Some(level) => {
                    // Credit the remainder of the aligned span this absent
                    // entry covers.
                    let span = (1i64 << level) - (virt & ((1i64 << level) - 1));
                    got += span as u64;
                    virt += span;
                }
                None => {
                    virt += PAGE_SIZE as i64;
                    start = virt;
                    got = 0;
                }
            }
        }
        Ok(start)
    }

    /// Unmap `[base, base + size)`. Reserved leaves give their reservation
    /// back; committed pool leaves return their frame to the free list; host
    /// leaves are cleared without touching the pool. Absent subtrees are
    /// skipped a whole level-stride at a time.
    fn free_virtual(&mut self, base: i64, size: u64) {
        let end = base + size as i64;
        let mut virt = base;
        trace!(base, size, "free virtual range");
        while virt < end {
            let mut stride_level = LEVEL_ROOT;
            if self.cr3 != 0 {
                let mut entry = self.cr3;
                let mut level = LEVEL_ROOT;
                loop {
                    let table = entry & PTE_TA;
                    let slot = table + table_index(virt, level) * 8;
                    entry = self.real.load64(slot);
                    if level == LEVEL_LEAF {
                        if entry & PTE_RSRV != 0 {
                            self.real.stats.reserved -= 1;
                            self.real.store64(slot, 0);
                        } else if entry & PTE_V != 0 {
                            if entry & PTE_HOST == 0 {
                                self.real.stats.committed -= 1;
                                self.real.append_free(entry & PTE_TA);
                            }
                            self.real.store64(slot, 0);
                        }
                        break;
                    }
                    if entry & PTE_V == 0 {
                        break;
                    }
                    level -= 9;
                }
                stride_level = level;
            }
            // Advance to the next boundary of the level we stopped at.
            virt += (1i64 << stride_level) - (virt & ((1i64 << stride_level) - 1));
        }
    }

    /// Project a committed leaf to its backing storage.
    fn page_host(&self, entry: u64) -> Option<Phys> {
        debug_assert!(entry & PTE_V != 0);
        debug_assert!(entry & PTE_RSRV == 0);
        let ta = entry & PTE_TA;
        if entry & PTE_HOST != 0 {
            if self.host.contains(ta) {
                Some(Phys::Host(ta))
            } else {
                None
            }
        } else if ta + PAGE_SIZE <= self.real.used() {
            Some(Phys::Ram(ta))
        } else {
            None
        }
    }

    fn bytes(&self, at: Phys, len: usize) -> &[u8] {
        match at {
            Phys::Ram(off) => self.real.slice(off, len),
            Phys::Host(off) => self.host.slice(off, len),
        }
    }

    fn bytes_mut(&mut self, at: Phys, len: usize) -> &mut [u8] {
        match at {
            Phys::Ram(off) => self.real.slice_mut(off, len),
            Phys::Host(off) => self.host.slice_mut(off, len),
        }
    }
}

/// Exclusive projection of a resolved range.
///
/// Holds the pool lock for its lifetime so the backing frame can neither
/// move (pool growth) nor be freed while the bytes are in use — the
/// per-instruction "no-grow" reservation token.
pub struct RamView<'a> {
    mem: RwLockWriteGuard<'a, SysMem>,
    at: Phys,
    len: usize,
}

impl Deref for RamView<'_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.mem.bytes(self.at, self.len)
    }
}

impl DerefMut for RamView<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.mem.bytes_mut(self.at, self.len)
    }
}

/// Shared guest memory for one guest: pool, page tables, statistics.
pub struct System {
    mem: RwLock<SysMem>,
    /// Guest-virtual happens to equal pool offsets; lets translation skip
    /// the walk entirely.
    linear: AtomicBool,
    /// Invalidation flags of every attached machine.
    invalidators: Mutex<Vec<Weak<AtomicBool>>>,
}

impl System {
    pub fn new() -> Self {
        Self::with_real_limit(DEFAULT_REAL_LIMIT)
    }

    /// A system whose pool refuses to grow past `limit` bytes
    /// (frame-rounded).
    pub fn with_real_limit(limit: u64) -> Self {
        Self {
            mem: RwLock::new(SysMem::new(limit)),
            linear: AtomicBool::new(false),
            invalidators: Mutex::new(Vec::new()),
        }
    }

    /// Register a TLB invalidation flag for a machine. The system holds only
    /// a weak reference; dropped machines are pruned on the next broadcast.
    pub fn attach_invalidator(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.invalidators
            .lock()
            .unwrap()
            .push(Arc::downgrade(&flag));
        flag
    }

    /// Tell every attached machine its TLB may hold retired translations.
    pub fn invalidate_tlbs(&self) {
        let mut flags = self.invalidators.lock().unwrap();
        flags.retain(|weak| match weak.upgrade() {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        });
    }

    /// Enable or disable the linear-mapping fast path.
    pub fn set_linear(&self, on: bool) {
        self.linear.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub fn linear(&self) -> bool {
        self.linear.load(Ordering::Relaxed)
    }

    /// Ensure pool capacity is at least `n` bytes.
    pub fn reserve_real(&self, n: u64) -> Result<(), MemError> {
        let mut mem = self.mem.write().unwrap();
        if mem.real.reserve(n) {
            Ok(())
        } else {
            Err(MemError::OutOfMemory)
        }
    }

    /// See [`SysMem::reserve_virtual`].
    pub fn reserve_virtual(&self, virt: i64, size: u64, key: u64) -> Result<(), MemError> {
        self.mem.write().unwrap().reserve_virtual(virt, size, key)
    }

    /// See [`SysMem::find_virtual`].
    pub fn find_virtual(&self, hint: i64, size: u64) -> Result<i64, MemError> {
        self.mem.read().unwrap().find_virtual(hint, size)
    }

    /// Unmap a range and invalidate every attached TLB.
    pub fn free_virtual(&self, base: i64, size: u64) {
        self.mem.write().unwrap().free_virtual(base, size);
        self.invalidate_tlbs();
    }

    /// Register a host-owned region and map it at `virt` through
    /// `PTE_HOST` leaves. Returns the region's arena handle.
    pub fn map_host(&self, virt: i64, bytes: Box<[u8]>) -> Result<u64, MemError> {
        let mut mem = self.mem.write().unwrap();
        let pages = round_up_page(bytes.len() as u64) / PAGE_SIZE;
        let base = mem.host.map(bytes);
        for i in 0..pages {
            let slot = mem.ensure_leaf_slot(virt + (i * PAGE_SIZE) as i64)?;
            mem.real
                .store64(slot, (base + i * PAGE_SIZE) | PTE_V | PTE_HOST | PTE_MAP);
        }
        debug!(virt, base, pages, "mapped host region");
        Ok(base)
    }

    /// Snapshot of the memory statistics.
    pub fn memstat(&self) -> MemStats {
        self.mem.read().unwrap().real.stats
    }

    /// The root page-table entry; zero when no address space exists.
    pub fn cr3(&self) -> u64 {
        self.mem.read().unwrap().cr3
    }

    pub fn real_used(&self) -> u64 {
        self.mem.read().unwrap().real.used()
    }

    pub fn real_capacity(&self) -> u64 {
        self.mem.read().unwrap().real.capacity()
    }

    pub fn real_limit(&self) -> u64 {
        self.mem.read().unwrap().real.limit()
    }

    pub(crate) fn free_runs(&self) -> Vec<(u64, u64)> {
        self.mem.read().unwrap().real.free_runs()
    }

    /// Drop the free list, rewind the pool, zero the statistics and clear
    /// CR3 and the host arena, then invalidate every attached TLB.
    pub fn reset_mem(&self) {
        {
            let mut mem = self.mem.write().unwrap();
            mem.real.reset();
            mem.host = HostArena::new();
            mem.cr3 = 0;
        }
        self.invalidate_tlbs();
    }

    /// Read-side page walk; see [`SysMem::walk`].
    pub fn walk(&self, virt: i64) -> Option<u64> {
        self.mem.read().unwrap().walk(virt)
    }

    /// Write-side commit of a reserved leaf; see [`SysMem::commit_page`].
    pub fn commit_page(&self, virt: i64) -> Option<u64> {
        self.mem.write().unwrap().commit_page(virt)
    }

    /// Project a committed leaf plus an in-page offset to its storage.
    pub fn project(&self, entry: u64, off: u64) -> Option<Phys> {
        debug_assert!(off < PAGE_SIZE);
        Some(self.mem.read().unwrap().page_host(entry)?.add(off))
    }

    /// Copy out of backing storage. `at` and `len` must come from a
    /// projection and stay within one page.
    pub fn read_at(&self, at: Phys, buf: &mut [u8]) {
        buf.copy_from_slice(self.mem.read().unwrap().bytes(at, buf.len()));
    }

    /// Copy into backing storage; same contract as [`System::read_at`].
    pub fn write_at(&self, at: Phys, buf: &[u8]) {
        self.mem
            .write()
            .unwrap()
            .bytes_mut(at, buf.len())
            .copy_from_slice(buf);
    }

    /// Pin the pool and expose `len` bytes at `at` directly.
    pub fn view(&self, at: Phys, len: usize) -> RamView<'_> {
        RamView {
            mem: self.mem.write().unwrap(),
            at,
            len,
        }
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}
