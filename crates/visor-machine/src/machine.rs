//! The per-CPU machine: TLB, walk driver, address resolution.
//!
//! A [`Machine`] owns everything private to one guest CPU and shares a
//! [`System`] with its siblings. Translation consults the TLB first, then
//! walks the shared page-table tree; guest-driven accesses commit reserved
//! pages on touch, while probing lookups leave them untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use visor_mem::pte::{is_valid_virt, page_of, PAGE_SIZE, PTE_RSRV};
use visor_mem::{Phys, System};

use crate::fault::Fault;
use crate::tlb::Tlb;

/// Guest CPU addressing mode, as far as this layer cares: real mode maps
/// identity into the pool, long mode walks the page tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    #[default]
    Long,
}

/// Stash size; one frame is enough for any sub-page operand plus the spill
/// into the next page.
pub(crate) const STASH_SIZE: usize = PAGE_SIZE as usize;

pub struct Machine {
    system: Arc<System>,
    pub(crate) tlb: Tlb,
    invalidated: Arc<AtomicBool>,
    mode: CpuMode,

    // Per-instruction operand stash (page-crossing accesses only).
    pub(crate) stash: Box<[u8]>,
    pub(crate) stash_addr: i64,
    pub(crate) stash_size: usize,
    pub(crate) stash_writable: bool,

    // Most recent guest spans touched by tracked copies, for debuggers and
    // signal delivery.
    pub(crate) read_addr: i64,
    pub(crate) read_size: u32,
    pub(crate) write_addr: i64,
    pub(crate) write_size: u32,

    /// Backing buffers for every string handed out by `load_str`; dropped
    /// with the machine.
    pub(crate) strings: Vec<Box<[u8]>>,
}

impl Machine {
    pub fn new(system: Arc<System>) -> Self {
        let invalidated = system.attach_invalidator();
        Self {
            system,
            tlb: Tlb::new(),
            invalidated,
            mode: CpuMode::default(),
            stash: vec![0u8; STASH_SIZE].into_boxed_slice(),
            stash_addr: 0,
            stash_size: 0,
            stash_writable: false,
            read_addr: 0,
            read_size: 0,
            write_addr: 0,
            write_size: 0,
            strings: Vec::new(),
        }
    }

    #[inline]
    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    #[inline]
    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CpuMode) {
        self.mode = mode;
    }

    #[inline]
    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// Rewind the shared memory to a pristine state and drop all per-CPU
    /// caches. Sibling machines see a TLB invalidation.
    pub fn reset_mem(&mut self) {
        self.system.reset_mem();
        self.tlb.reset();
        self.invalidated.store(false, Ordering::Relaxed);
        self.strings.clear();
        self.stash_addr = 0;
    }

    /// Translate a page base to its committed leaf PTE.
    ///
    /// With `commit` set (guest-driven accesses) a reserved leaf is
    /// committed on touch; without it (probing) a reserved leaf is a miss.
    /// Only committed leaves enter the TLB.
    pub(crate) fn translate(&mut self, page: i64, commit: bool) -> Option<u64> {
        debug_assert_eq!(page, page_of(page));
        if self.invalidated.load(Ordering::Relaxed) {
            self.tlb.reset();
            self.invalidated.store(false, Ordering::Relaxed);
        } else if let Some(entry) = self.tlb.lookup(page) {
            return Some(entry);
        }
        if !is_valid_virt(page) {
            return None;
        }
        let mut entry = self.system.walk(page)?;
        if entry & PTE_RSRV != 0 {
            if !commit {
                return None;
            }
            entry = self.system.commit_page(page)?;
        }
        self.tlb.install(page, entry);
        Some(entry)
    }

    fn resolve(&mut self, virt: i64, commit: bool) -> Option<Phys> {
        match self.mode {
            CpuMode::Real => {
                // Identity mapping inside the 32-bit window, clamped to the
                // pool's current capacity.
                if (0..=0xffff_ffff).contains(&virt)
                    && (virt as u64) + PAGE_SIZE <= self.system.real_capacity()
                {
                    Some(Phys::Ram(virt as u64))
                } else {
                    None
                }
            }
            CpuMode::Long => {
                let entry = self.translate(page_of(virt), commit)?;
                self.system.project(entry, (virt & 4095) as u64)
            }
        }
    }

    /// Probing translation: never commits a reserved page.
    pub fn lookup_address(&mut self, virt: i64) -> Option<Phys> {
        self.resolve(virt, false)
    }

    /// Translation for a guest access: commits reserved pages on touch. The
    /// linear-mapping fast path skips the walk entirely.
    pub fn get_address(&mut self, virt: i64) -> Option<Phys> {
        if self.system.linear() {
            if virt >= 0 && (virt as u64) + PAGE_SIZE <= self.system.real_capacity() {
                return Some(Phys::Ram(virt as u64));
            }
            return None;
        }
        self.resolve(virt, true)
    }

    /// [`Machine::get_address`], with a miss surfaced as a segmentation
    /// fault. The only fault source in this layer.
    pub fn resolve_address(&mut self, virt: i64) -> Result<Phys, Fault> {
        self.get_address(virt)
            .ok_or(Fault::Segmentation { addr: virt })
    }

    /// Span of the most recent tracked guest read.
    #[inline]
    pub fn read_span(&self) -> (i64, u32) {
        (self.read_addr, self.read_size)
    }

    /// Span of the most recent tracked guest write.
    #[inline]
    pub fn write_span(&self) -> (i64, u32) {
        (self.write_addr, self.write_size)
    }

    pub(crate) fn set_read_addr(&mut self, addr: i64, size: u32) {
        if size != 0 {
            self.read_addr = addr;
            self.read_size = size;
        }
    }

    pub(crate) fn set_write_addr(&mut self, addr: i64, size: u32) {
        if size != 0 {
            self.write_addr = addr;
            self.write_size = size;
        }
    }
}
