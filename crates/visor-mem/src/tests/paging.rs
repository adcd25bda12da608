use pretty_assertions::assert_eq;

use crate::pte::{PAGE_SIZE, PTE_MAP, PTE_RSRV, PTE_RW, PTE_TA, PTE_U, PTE_V, VIRT_MAX, VIRT_MIN};
use crate::{MemError, System};

const KEY: u64 = PTE_RSRV | PTE_MAP | PTE_RW | PTE_U;

#[test]
fn first_reservation_creates_the_address_space() {
    let sys = System::new();
    assert_eq!(sys.cr3(), 0);
    sys.reserve_virtual(0x4000, PAGE_SIZE, KEY).unwrap();
    assert_ne!(sys.cr3(), 0);
    assert_eq!(sys.memstat().pagetables, 3);
    assert_eq!(sys.memstat().reserved, 1);
}

#[test]
fn reserved_leaf_walks_but_is_not_valid() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, PAGE_SIZE, KEY).unwrap();
    let leaf = sys.walk(0x4000).unwrap();
    assert_eq!(leaf & PTE_V, 0);
    assert_ne!(leaf & PTE_RSRV, 0);
    assert_eq!(sys.walk(0x5000), None);
}

#[test]
fn reservation_is_idempotent() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, 2 * PAGE_SIZE, KEY).unwrap();
    sys.reserve_virtual(0x4000, 2 * PAGE_SIZE, KEY | PTE_MAP)
        .unwrap();
    assert_eq!(sys.memstat().reserved, 2);

    // A committed leaf is also left untouched.
    let committed = sys.commit_page(0x4000).unwrap();
    sys.reserve_virtual(0x4000, PAGE_SIZE, KEY).unwrap();
    assert_eq!(sys.walk(0x4000), Some(committed));
    assert_eq!(sys.memstat().reserved, 1);
}

#[test]
fn reservation_sweeps_across_table_boundaries() {
    let sys = System::new();
    // 512 leaves end the first leaf table exactly; three more spill into the
    // next one, forcing a re-descent mid-reservation.
    let base = 0x1ff000;
    sys.reserve_virtual(base, 4 * PAGE_SIZE, KEY).unwrap();
    assert_eq!(sys.memstat().reserved, 4);
    // Root, one L3, one L2 and two leaf tables.
    assert_eq!(sys.memstat().pagetables, 4);
    assert!(sys.walk(base).is_some());
    assert!(sys.walk(base + 3 * PAGE_SIZE as i64).is_some());
}

#[test]
fn commit_swaps_reserved_for_valid() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, PAGE_SIZE, KEY).unwrap();
    let before = sys.memstat();

    let leaf = sys.commit_page(0x4000).unwrap();
    assert_ne!(leaf & PTE_V, 0);
    assert_eq!(leaf & PTE_RSRV, 0);
    // Permission and mapping bits of the key survive the commit.
    assert_ne!(leaf & PTE_MAP, 0);
    assert_ne!(leaf & PTE_RW, 0);

    let after = sys.memstat();
    assert_eq!(after.reserved, before.reserved - 1);
    assert_eq!(after.committed, before.committed + 1);

    // A second commit observes the first.
    assert_eq!(sys.commit_page(0x4000), Some(leaf));
    assert_eq!(sys.memstat().committed, after.committed);
}

#[test]
fn committed_frames_are_zeroed() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, PAGE_SIZE, KEY).unwrap();
    let leaf = sys.commit_page(0x4000).unwrap();
    let at = sys.project(leaf, 0).unwrap();
    let mut buf = [0xAAu8; 64];
    sys.read_at(at, &mut buf);
    assert_eq!(buf, [0u8; 64]);
}

#[test]
fn free_returns_reservations_and_frames() {
    let sys = System::new();
    let baseline = sys.memstat().reserved;
    sys.reserve_virtual(0x4000, 4 * PAGE_SIZE, KEY).unwrap();
    sys.commit_page(0x4000).unwrap();
    sys.commit_page(0x5000).unwrap();

    sys.free_virtual(0x4000, 4 * PAGE_SIZE);

    let s = sys.memstat();
    assert_eq!(s.reserved, baseline);
    for i in 0..4 {
        assert_eq!(sys.walk(0x4000 + i * PAGE_SIZE as i64), None);
    }
    // Both committed frames came back.
    assert_eq!(s.freed, 2);
}

#[test]
fn free_of_unmapped_space_is_a_noop() {
    let sys = System::new();
    sys.free_virtual(0x4000, 1 << 30);
    sys.reserve_virtual(0x4000, PAGE_SIZE, KEY).unwrap();
    sys.free_virtual(0x100000, 1 << 30);
    assert_eq!(sys.memstat().reserved, 1);
}

#[test]
fn freeing_in_address_order_coalesces() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, 3 * PAGE_SIZE, KEY).unwrap();
    let a = sys.commit_page(0x4000).unwrap() & PTE_TA;
    let b = sys.commit_page(0x5000).unwrap() & PTE_TA;
    let c = sys.commit_page(0x6000).unwrap() & PTE_TA;
    // Bump allocation hands out ascending frames.
    assert_eq!(b, a + PAGE_SIZE);
    assert_eq!(c, b + PAGE_SIZE);

    sys.free_virtual(0x4000, PAGE_SIZE);
    sys.free_virtual(0x5000, PAGE_SIZE);
    sys.free_virtual(0x6000, PAGE_SIZE);
    assert_eq!(sys.free_runs(), vec![(a, 3 * PAGE_SIZE)]);
}

#[test]
fn freeing_in_reverse_order_leaves_three_runs() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, 3 * PAGE_SIZE, KEY).unwrap();
    let a = sys.commit_page(0x4000).unwrap() & PTE_TA;
    let b = sys.commit_page(0x5000).unwrap() & PTE_TA;
    let c = sys.commit_page(0x6000).unwrap() & PTE_TA;

    sys.free_virtual(0x6000, PAGE_SIZE);
    sys.free_virtual(0x5000, PAGE_SIZE);
    sys.free_virtual(0x4000, PAGE_SIZE);
    assert_eq!(
        sys.free_runs(),
        vec![(c, PAGE_SIZE), (b, PAGE_SIZE), (a, PAGE_SIZE)]
    );
}

#[test]
fn find_virtual_on_an_empty_system_returns_the_hint() {
    let sys = System::new();
    assert_eq!(sys.find_virtual(0x10000, 1 << 20), Ok(0x10000));
}

#[test]
fn find_virtual_skips_mapped_pages() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, 2 * PAGE_SIZE, KEY).unwrap();
    let got = sys.find_virtual(0x4000, 4 * PAGE_SIZE).unwrap();
    assert_eq!(got, 0x6000);
}

#[test]
fn find_virtual_restarts_after_a_present_leaf() {
    let sys = System::new();
    // A hole of three pages, then a mapped page, then open space.
    sys.reserve_virtual(0x7000, PAGE_SIZE, KEY).unwrap();
    let got = sys.find_virtual(0x4000, 4 * PAGE_SIZE).unwrap();
    assert_eq!(got, 0x8000);
}

#[test]
fn find_virtual_fails_past_the_top_of_the_space() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, PAGE_SIZE, KEY).unwrap();
    assert_eq!(
        sys.find_virtual(VIRT_MAX - PAGE_SIZE as i64, 2 * PAGE_SIZE),
        Err(MemError::OutOfMemory)
    );
}

#[test]
fn walk_covers_the_whole_canonical_range() {
    let sys = System::new();
    sys.reserve_virtual(VIRT_MIN, PAGE_SIZE, KEY).unwrap();
    sys.reserve_virtual(VIRT_MAX - PAGE_SIZE as i64, PAGE_SIZE, KEY)
        .unwrap();
    assert!(sys.walk(VIRT_MIN).is_some());
    assert!(sys.walk(VIRT_MAX - PAGE_SIZE as i64).is_some());
    assert_eq!(sys.walk(0), None);
}

#[test]
fn reset_mem_drops_the_address_space() {
    let sys = System::new();
    sys.reserve_virtual(0x4000, PAGE_SIZE, KEY).unwrap();
    sys.commit_page(0x4000).unwrap();
    sys.reset_mem();
    assert_eq!(sys.cr3(), 0);
    assert_eq!(sys.real_used(), 0);
    assert_eq!(sys.memstat(), Default::default());
    assert_eq!(sys.walk(0x4000), None);
}
