//! Guest access primitives: bulk copies, the per-instruction operand stash,
//! the two-page splice used for sub-page operands, and string loaders.
//!
//! Every page-crossing operation computes a per-iteration chunk of
//! `min(remaining, bytes-left-in-page)` and resolves each page separately, so
//! a fault surfaces before the chunk that would touch the unmapped page.

use std::ffi::{CStr, CString};
use std::mem;
use std::ops::{Deref, DerefMut};

use visor_mem::pte::PAGE_SIZE;
use visor_mem::RamView;

use crate::fault::Fault;
use crate::machine::Machine;

/// Bytes left in the page containing `v`.
#[inline]
fn page_remainder(v: i64) -> usize {
    (PAGE_SIZE - (v as u64 & (PAGE_SIZE - 1))) as usize
}

/// Host view of one guest operand.
///
/// Single-page operands resolve to [`Ram::Mapped`], a direct view that pins
/// the pool while it lives. Page-crossing operands are staged in a buffer —
/// the machine's stash for [`Machine::reserve_address`], a caller-supplied
/// scratch for the splice family — and written back explicitly.
pub enum Ram<'m, 't> {
    Mapped(RamView<'m>),
    Buffered(&'t mut [u8]),
}

impl Deref for Ram<'_, '_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match self {
            Ram::Mapped(view) => view,
            Ram::Buffered(buf) => buf,
        }
    }
}

impl DerefMut for Ram<'_, '_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Ram::Mapped(view) => view,
            Ram::Buffered(buf) => buf,
        }
    }
}

impl Machine {
    /// Copy `dst.len()` bytes out of guest memory at `src`. Reserved pages
    /// commit on touch; a zero-length copy never faults.
    pub fn copy_from_user(&mut self, dst: &mut [u8], src: i64) -> Result<(), Fault> {
        let mut v = src;
        let mut off = 0;
        while off < dst.len() {
            let k = page_remainder(v).min(dst.len() - off);
            let at = self.resolve_address(v)?;
            self.system().read_at(at, &mut dst[off..off + k]);
            v += k as i64;
            off += k;
        }
        Ok(())
    }

    /// Copy `src.len()` bytes into guest memory at `dst`.
    pub fn copy_to_user(&mut self, dst: i64, src: &[u8]) -> Result<(), Fault> {
        let mut v = dst;
        let mut off = 0;
        while off < src.len() {
            let k = page_remainder(v).min(src.len() - off);
            let at = self.resolve_address(v)?;
            self.system().write_at(at, &src[off..off + k]);
            v += k as i64;
            off += k;
        }
        Ok(())
    }

    /// [`Machine::copy_from_user`], recording the span for debuggers and
    /// signal delivery.
    pub fn copy_from_user_read(&mut self, dst: &mut [u8], src: i64) -> Result<(), Fault> {
        self.copy_from_user(dst, src)?;
        self.set_read_addr(src, dst.len() as u32);
        Ok(())
    }

    /// [`Machine::copy_to_user`], recording the span.
    pub fn copy_to_user_write(&mut self, dst: i64, src: &[u8]) -> Result<(), Fault> {
        self.copy_to_user(dst, src)?;
        self.set_write_addr(dst, src.len() as u32);
        Ok(())
    }

    /// Expose `n` guest bytes at `v` for the duration of one instruction.
    ///
    /// A range inside one page resolves directly; writes through the view
    /// land in guest memory immediately and [`Machine::commit_stash`] has
    /// nothing to do. A page-crossing range is copied into the stash; the
    /// interpreter mutates the stash and `commit_stash` writes it back at
    /// retire (when `writable`).
    pub fn reserve_address(
        &mut self,
        v: i64,
        n: usize,
        writable: bool,
    ) -> Result<Ram<'_, '_>, Fault> {
        debug_assert!(n <= self.stash.len());
        if (v as u64 & (PAGE_SIZE - 1)) + n as u64 <= PAGE_SIZE {
            let at = self.resolve_address(v)?;
            return Ok(Ram::Mapped(self.system().view(at, n)));
        }
        self.stash_addr = v;
        self.stash_size = n;
        self.stash_writable = writable;
        let mut stash = mem::take(&mut self.stash);
        let copied = self.copy_from_user(&mut stash[..n], v);
        self.stash = stash;
        copied?;
        Ok(Ram::Buffered(&mut self.stash[..n]))
    }

    /// Write an active, writable stash back to the guest range it shadows.
    /// The stash is deactivated first, so a faulting write-back still
    /// discards it.
    pub fn commit_stash(&mut self) -> Result<(), Fault> {
        let addr = self.stash_addr;
        self.stash_addr = 0;
        if addr != 0 && self.stash_writable {
            let stash = mem::take(&mut self.stash);
            let wrote = self.copy_to_user(addr, &stash[..self.stash_size]);
            self.stash = stash;
            wrote?;
        }
        Ok(())
    }

    /// Whether a page-crossing operand is currently staged.
    #[inline]
    pub fn stash_active(&self) -> bool {
        self.stash_addr != 0
    }

    /// Two-page splice: resolve `n` bytes at `v` (at most one frame), using
    /// `tmp` when the range straddles a page boundary. With `copy`, `tmp` is
    /// filled from both halves first.
    fn access_ram<'t>(
        &mut self,
        v: i64,
        n: usize,
        tmp: &'t mut [u8],
        copy: bool,
    ) -> Result<Ram<'_, 't>, Fault> {
        debug_assert!(n as u64 <= PAGE_SIZE && n <= tmp.len());
        if (v as u64 & (PAGE_SIZE - 1)) + n as u64 <= PAGE_SIZE {
            let at = self.resolve_address(v)?;
            return Ok(Ram::Mapped(self.system().view(at, n)));
        }
        let k = page_remainder(v);
        let a = self.resolve_address(v)?;
        let b = self.resolve_address(v + k as i64)?;
        if copy {
            self.system().read_at(a, &mut tmp[..k]);
            self.system().read_at(b, &mut tmp[k..n]);
        }
        Ok(Ram::Buffered(&mut tmp[..n]))
    }

    /// Read access to `n` guest bytes, spliced through `tmp` when crossing.
    pub fn load<'t>(&mut self, v: i64, n: usize, tmp: &'t mut [u8]) -> Result<Ram<'_, 't>, Fault> {
        self.set_read_addr(v, n as u32);
        self.access_ram(v, n, tmp, true)
    }

    /// Write access to `n` guest bytes. A `Buffered` result must be filled
    /// and handed to [`Machine::end_store`].
    pub fn begin_store<'t>(
        &mut self,
        v: i64,
        n: usize,
        tmp: &'t mut [u8],
    ) -> Result<Ram<'_, 't>, Fault> {
        self.set_write_addr(v, n as u32);
        self.access_ram(v, n, tmp, false)
    }

    /// [`Machine::begin_store`] with the guest NULL convention: `v == 0`
    /// resolves to no access at all.
    pub fn begin_store_np<'t>(
        &mut self,
        v: i64,
        n: usize,
        tmp: &'t mut [u8],
    ) -> Result<Option<Ram<'_, 't>>, Fault> {
        if v == 0 {
            return Ok(None);
        }
        self.begin_store(v, n, tmp).map(Some)
    }

    /// Read-modify-write access: like [`Machine::begin_store`] but with the
    /// current bytes copied in.
    pub fn begin_load_store<'t>(
        &mut self,
        v: i64,
        n: usize,
        tmp: &'t mut [u8],
    ) -> Result<Ram<'_, 't>, Fault> {
        self.set_write_addr(v, n as u32);
        self.access_ram(v, n, tmp, true)
    }

    /// Finish a store begun with [`Machine::begin_store`]: write `tmp` back
    /// to both halves of a page-crossing range. Single-page stores already
    /// wrote through the mapped view and need nothing here.
    pub fn end_store(&mut self, v: i64, n: usize, tmp: &[u8]) -> Result<(), Fault> {
        debug_assert!(n as u64 <= PAGE_SIZE && n <= tmp.len());
        if (v as u64 & (PAGE_SIZE - 1)) + n as u64 <= PAGE_SIZE {
            return Ok(());
        }
        let k = page_remainder(v);
        let a = self.resolve_address(v)?;
        let b = self.resolve_address(v + k as i64)?;
        self.system().write_at(a, &tmp[..k]);
        self.system().write_at(b, &tmp[k..n]);
        Ok(())
    }

    /// [`Machine::end_store`] with the guest NULL convention.
    pub fn end_store_np(&mut self, v: i64, n: usize, tmp: &[u8]) -> Result<(), Fault> {
        if v == 0 {
            return Ok(());
        }
        self.end_store(v, n, tmp)
    }

    /// Load the NUL-terminated guest string at `addr`.
    ///
    /// The bytes are materialized into a machine-owned buffer that lives
    /// until reset or teardown, so the returned reference stays cheap for
    /// callers that immediately copy or inspect it. Returns `None` for guest
    /// NULL and for strings that run into unmapped memory before their
    /// terminator. The recorded read span includes the terminator.
    pub fn load_str(&mut self, addr: i64) -> Option<&CStr> {
        if addr == 0 {
            return None;
        }
        let mut have = page_remainder(addr);
        let at = self.get_address(addr)?;
        let mut copy = vec![0u8; have];
        self.system().read_at(at, &mut copy);
        if let Some(nul) = copy.iter().position(|&b| b == 0) {
            copy.truncate(nul + 1);
            self.set_read_addr(addr, (nul + 1) as u32);
            return self.intern(copy);
        }
        let mut page = vec![0u8; PAGE_SIZE as usize];
        loop {
            let at = self.get_address(addr + have as i64)?;
            self.system().read_at(at, &mut page);
            match page.iter().position(|&b| b == 0) {
                Some(nul) => {
                    copy.extend_from_slice(&page[..nul + 1]);
                    self.set_read_addr(addr, (have + nul + 1) as u32);
                    return self.intern(copy);
                }
                None => {
                    copy.extend_from_slice(&page);
                    have += PAGE_SIZE as usize;
                }
            }
        }
    }

    fn intern(&mut self, bytes: Vec<u8>) -> Option<&CStr> {
        self.strings.push(bytes.into_boxed_slice());
        let bytes = self.strings.last().expect("just pushed");
        CStr::from_bytes_with_nul(bytes).ok()
    }

    /// Number of string buffers currently owned by the machine.
    #[inline]
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    /// Load a guest argv-style pointer array terminated by a zero word,
    /// resolving each element with [`Machine::load_str`]. The array and its
    /// strings are returned by value and owned by the caller.
    pub fn load_str_list(&mut self, addr: i64) -> Option<Vec<CString>> {
        let mut list = Vec::new();
        for i in 0i64.. {
            let mut word = [0u8; 8];
            self.copy_from_user_read(&mut word, addr + i * 8).ok()?;
            let ptr = i64::from_le_bytes(word);
            if ptr == 0 {
                break;
            }
            list.push(self.load_str(ptr)?.to_owned());
        }
        Some(list)
    }
}
