//! Page-table entry layout and paging geometry.
//!
//! Entries are raw `u64`s rather than a wrapper type: the walker and the
//! reservation engine mostly move them around whole, and the handful of bit
//! tests read better against named masks.

/// Guest page/frame size. All pool and page-table arithmetic is stated
/// modulo this.
pub const PAGE_SIZE: u64 = 4096;

/// Leaf is mapped and committed to a frame.
pub const PTE_V: u64 = 1 << 0;
/// Writable. Carried through reservation keys; not enforced by the walker.
pub const PTE_RW: u64 = 1 << 1;
/// User-accessible. Carried, not enforced.
pub const PTE_U: u64 = 1 << 2;
/// Reserved: the virtual page exists but no frame is committed yet.
///
/// A leaf holds exactly one of {nothing, `PTE_RSRV`, `PTE_V`}.
pub const PTE_RSRV: u64 = 1 << 9;
/// The translation address names a host-registered region, not a pool frame.
pub const PTE_HOST: u64 = 1 << 10;
/// Entry was created by an mmap-style mapping.
pub const PTE_MAP: u64 = 1 << 11;
/// Page-aligned translation address field.
pub const PTE_TA: u64 = 0x0000_7FFF_FFFF_F000;

/// Flags written on intermediate (non-leaf) entries.
pub const PTE_TABLE: u64 = PTE_V | PTE_RW | PTE_U;

/// Lowest guest-virtual address of the 48-bit signed space.
pub const VIRT_MIN: i64 = -0x8000_0000_0000;
/// One past the highest guest-virtual address.
pub const VIRT_MAX: i64 = 0x8000_0000_0000;

/// Shift of the root page-table level. Each level below subtracts 9 until
/// the leaf level at [`LEVEL_LEAF`].
pub const LEVEL_ROOT: u32 = 39;
/// Shift of the leaf level.
pub const LEVEL_LEAF: u32 = 12;

#[inline]
pub fn is_valid_virt(virt: i64) -> bool {
    (VIRT_MIN..VIRT_MAX).contains(&virt)
}

/// Index of `virt` within the 512-entry table at `level`.
#[inline]
pub fn table_index(virt: i64, level: u32) -> u64 {
    ((virt >> level) & 511) as u64
}

/// Base of the page containing `virt`.
#[inline]
pub fn page_of(virt: i64) -> i64 {
    virt & -(PAGE_SIZE as i64)
}

/// Round `n` up to a whole number of frames.
#[inline]
pub fn round_up_page(n: u64) -> u64 {
    (n + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_index_covers_negative_addresses() {
        // The sign-extended half of the canonical space indexes the upper
        // half of the root table.
        assert_eq!(table_index(VIRT_MIN, LEVEL_ROOT), 256);
        assert_eq!(table_index(-1, LEVEL_ROOT), 511);
        assert_eq!(table_index(0, LEVEL_ROOT), 0);
        assert_eq!(table_index(VIRT_MAX - 1, LEVEL_ROOT), 255);
    }

    #[test]
    fn page_of_rounds_toward_negative_infinity() {
        assert_eq!(page_of(0x1234), 0x1000);
        assert_eq!(page_of(-1), -4096);
        assert_eq!(page_of(VIRT_MIN), VIRT_MIN);
    }

    #[test]
    fn virt_range() {
        assert!(is_valid_virt(0));
        assert!(is_valid_virt(VIRT_MIN));
        assert!(is_valid_virt(VIRT_MAX - 1));
        assert!(!is_valid_virt(VIRT_MAX));
        assert!(!is_valid_virt(VIRT_MIN - 1));
    }
}
