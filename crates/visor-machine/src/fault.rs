use thiserror::Error;

/// Guest-visible memory fault, reported back to the instruction dispatcher.
///
/// The dispatcher unwinds the current instruction with `?`; bulk operations
/// leave no partial state behind other than the operand stash, which
/// [`crate::Machine::commit_stash`] finalizes only on successful retire.
///
/// Every failure of a guest access surfaces as a segmentation fault,
/// including pool exhaustion during a commit-on-touch: the page could not be
/// backed, so as far as the guest is concerned the address is bad.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Fault {
    /// Guest access to an unmapped, out-of-range, or unbackable virtual
    /// address.
    #[error("segmentation fault at {addr:#x}")]
    Segmentation { addr: i64 },
}
