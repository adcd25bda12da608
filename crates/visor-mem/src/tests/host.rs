use pretty_assertions::assert_eq;

use crate::pte::{PAGE_SIZE, PTE_HOST, PTE_MAP, PTE_V};
use crate::{Phys, System};

#[test]
fn host_regions_map_through_host_leaves() {
    let sys = System::new();
    let data = vec![0x5Au8; PAGE_SIZE as usize + 100];
    let base = sys.map_host(0x40000, data.into_boxed_slice()).unwrap();

    let leaf = sys.walk(0x40000).unwrap();
    assert_ne!(leaf & PTE_V, 0);
    assert_ne!(leaf & PTE_HOST, 0);
    assert_ne!(leaf & PTE_MAP, 0);

    // Both pages project into the arena, not the pool.
    let p0 = sys.project(leaf, 0).unwrap();
    assert_eq!(p0, Phys::Host(base));
    let leaf1 = sys.walk(0x41000).unwrap();
    assert_eq!(sys.project(leaf1, 0).unwrap(), Phys::Host(base + PAGE_SIZE));

    let mut buf = [0u8; 4];
    sys.read_at(p0, &mut buf);
    assert_eq!(buf, [0x5A; 4]);

    // The padding tail reads as zero.
    let mut tail = [0xFFu8; 4];
    sys.read_at(Phys::Host(base + PAGE_SIZE + 100), &mut tail);
    assert_eq!(tail, [0; 4]);
}

#[test]
fn host_regions_are_writable() {
    let sys = System::new();
    let base = sys
        .map_host(0x40000, vec![0u8; PAGE_SIZE as usize].into_boxed_slice())
        .unwrap();
    sys.write_at(Phys::Host(base + 8), b"abcd");
    let mut buf = [0u8; 4];
    sys.read_at(Phys::Host(base + 8), &mut buf);
    assert_eq!(&buf, b"abcd");
}

#[test]
fn freeing_a_host_mapping_leaves_the_pool_alone() {
    let sys = System::new();
    sys.map_host(0x40000, vec![1u8; PAGE_SIZE as usize].into_boxed_slice())
        .unwrap();
    let before = sys.memstat();
    sys.free_virtual(0x40000, PAGE_SIZE);
    let after = sys.memstat();
    assert_eq!(sys.walk(0x40000), None);
    assert_eq!(after.freed, before.freed);
    assert_eq!(after.committed, before.committed);
}
