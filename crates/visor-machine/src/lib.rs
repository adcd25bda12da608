//! Per-CPU guest memory access for an x86_64 emulator.
//!
//! Each guest CPU is a [`Machine`] sharing one [`System`] (the physical pool
//! and page-table tree from `visor-mem`) with its siblings. This crate adds
//! the per-CPU pieces: the software TLB with its hint-byte prefilter, the
//! walk driver that commits reserved pages on touch, the bulk-copy and
//! operand-stash primitives the instruction interpreter calls, and loaders
//! for NUL-terminated guest strings and argv-style pointer arrays.
//!
//! Faults are ordinary `Result` values ([`Fault`]); the interpreter unwinds
//! the current instruction with `?` and finalizes the operand stash only on
//! successful retire.

mod access;
mod fault;
mod machine;
mod tlb;

pub use access::Ram;
pub use fault::Fault;
pub use machine::{CpuMode, Machine};
pub use tlb::{Tlb, TlbStats, TLB_ENTRIES};

pub use visor_mem::{pte, MemError, MemStats, Phys, RamView, System, DEFAULT_REAL_LIMIT};
