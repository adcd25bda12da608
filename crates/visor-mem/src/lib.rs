//! Shared guest physical memory for an x86_64 emulator.
//!
//! One [`System`] backs all the CPUs of a guest: a grow-on-demand physical
//! pool with a frame free list, the 4-level page-table tree, reservation
//! bookkeeping, and a host-region arena for surfacing host-owned memory to
//! the guest. Per-CPU concerns (the software TLB, the operand stash, the
//! bulk-copy API) live in `visor-machine`.

pub mod pte;
mod real;
mod system;

pub use real::{MemStats, DEFAULT_REAL_LIMIT};
pub use system::{Phys, RamView, System};

use thiserror::Error;

/// Failures of the shared memory layer.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MemError {
    /// The pool is at its ceiling, or a reservation could not be backed.
    #[error("out of guest physical memory")]
    OutOfMemory,
}

#[cfg(test)]
mod tests;
