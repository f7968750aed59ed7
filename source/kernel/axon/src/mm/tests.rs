// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unit and property tests for Sv39 page tables
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; verify alignment, flags, W^X, double map, translate, teardown

extern crate alloc;

use alloc::sync::Arc;

use proptest::prelude::*;

use super::{AddressSpace, MapError, PageFlags, PageTable, PhysMemory, PAGE_SIZE};
use crate::hal::CountingTlb;

const BASE: usize = 0x8000_0000;
const RW: PageFlags = PageFlags::VALID.union(PageFlags::READ).union(PageFlags::WRITE);

fn pool(frames: usize) -> PhysMemory {
    PhysMemory::new(BASE, frames)
}

#[test]
fn rejects_unaligned_addresses() {
    let mut mem = pool(8);
    let mut table = PageTable::new(&mut mem).unwrap();
    assert_eq!(table.map(&mut mem, 1, BASE, PAGE_SIZE, RW), Err(MapError::Unaligned));
    assert_eq!(table.map(&mut mem, 0x1000, BASE + 1, PAGE_SIZE, RW), Err(MapError::Unaligned));
    assert_eq!(table.map(&mut mem, 0x1000, BASE, 100, RW), Err(MapError::Unaligned));
    assert_eq!(table.map(&mut mem, 0x1000, BASE, 0, RW), Err(MapError::EmptyRange));
}

#[test]
fn rejects_invalid_flags() {
    let mut mem = pool(8);
    let mut table = PageTable::new(&mut mem).unwrap();
    assert_eq!(table.map(&mut mem, 0x1000, BASE, PAGE_SIZE, PageFlags::empty()), Err(MapError::InvalidFlags));
    assert_eq!(table.map(&mut mem, 0x1000, BASE, PAGE_SIZE, PageFlags::VALID), Err(MapError::InvalidFlags));
    assert_eq!(
        table.map(&mut mem, 0x1000, BASE, PAGE_SIZE, PageFlags::VALID | PageFlags::WRITE),
        Err(MapError::InvalidFlags)
    );
}

#[test]
fn enforces_w_xor_x() {
    let mut mem = pool(8);
    let mut table = PageTable::new(&mut mem).unwrap();
    let flags = RW | PageFlags::EXECUTE;
    assert_eq!(table.map(&mut mem, 0x1000, BASE, PAGE_SIZE, flags), Err(MapError::PermissionDenied));
}

#[test]
fn out_of_range_rejected() {
    let mut mem = pool(8);
    let mut table = PageTable::new(&mut mem).unwrap();
    let va = 1usize << 50;
    assert_eq!(table.map(&mut mem, va, BASE, PAGE_SIZE, RW), Err(MapError::OutOfRange));
    // Crosses from the top of the lower half into the hole.
    let top = (1usize << 38) - PAGE_SIZE;
    assert_eq!(table.map(&mut mem, top, BASE, 2 * PAGE_SIZE, RW), Err(MapError::OutOfRange));
}

#[test]
fn translate_keeps_page_offset() {
    let mut mem = pool(8);
    let frame = mem.alloc_zeroed().unwrap();
    let mut table = PageTable::new(&mut mem).unwrap();
    table.map(&mut mem, 0x4000, frame, PAGE_SIZE, RW).unwrap();
    assert_eq!(table.translate(&mem, 0x4000), Some(frame));
    assert_eq!(table.translate(&mem, 0x4abc), Some(frame + 0xabc));
    assert_eq!(table.translate(&mem, 0x5000), None);
    assert_eq!(table.translate(&mem, 0x3fff), None);
    let (pa, flags) = table.lookup(&mem, 0x4010).unwrap();
    assert_eq!(pa, frame);
    assert_eq!(flags, RW);
}

#[test]
fn double_map_rejected_without_touching_existing_entries() {
    let mut mem = pool(16);
    let a = mem.alloc_zeroed().unwrap();
    let b = mem.alloc_zeroed().unwrap();
    let mut table = PageTable::new(&mut mem).unwrap();
    table.map(&mut mem, 0x2000, a, PAGE_SIZE, RW).unwrap();

    // Range [0x1000, 0x3000) overlaps the page at 0x2000 only.
    assert_eq!(table.map(&mut mem, 0x1000, b, 2 * PAGE_SIZE, RW), Err(MapError::AlreadyMapped));
    assert_eq!(table.translate(&mem, 0x2000), Some(a));
    assert_eq!(table.translate(&mem, 0x1000), None);
}

#[test]
fn table_allocation_failure_rolls_back() {
    // Root plus one level-1 table fit; the second level-0 table does not.
    let mut mem = pool(4);
    let frame = mem.alloc_zeroed().unwrap();
    let mut table = PageTable::new(&mut mem).unwrap();
    let start = 0x20_0000 - PAGE_SIZE;
    assert_eq!(
        table.map(&mut mem, start, frame, 2 * PAGE_SIZE, RW),
        Err(MapError::OutOfMemory)
    );
    assert_eq!(table.translate(&mem, start), None);
    assert!(table.mappings(&mem).is_empty());
}

#[test]
fn unmap_frees_only_owned_frames() {
    let mut mem = pool(16);
    let borrowed = mem.alloc_zeroed().unwrap();
    let owned = mem.alloc_zeroed().unwrap();
    let mut table = PageTable::new(&mut mem).unwrap();
    table.map(&mut mem, 0x1000, borrowed, PAGE_SIZE, RW).unwrap();
    table.map(&mut mem, 0x2000, owned, PAGE_SIZE, RW | PageFlags::OWNED).unwrap();

    assert_eq!(table.unmap(&mut mem, 0x1000, 3 * PAGE_SIZE), Ok(2));
    assert!(mem.is_allocated(borrowed));
    assert!(!mem.is_allocated(owned));
    assert_eq!(table.translate(&mem, 0x2000), None);
}

#[test]
fn destroy_returns_every_frame() {
    let mut mem = pool(32);
    let before = mem.free_frames();
    let mut table = PageTable::new(&mut mem).unwrap();
    for (i, va) in [0x1000usize, 0x40_0000, 0x4000_0000].into_iter().enumerate() {
        let frame = mem.alloc_zeroed().unwrap();
        table.map(&mut mem, va + i * PAGE_SIZE, frame, PAGE_SIZE, RW | PageFlags::OWNED).unwrap();
    }
    assert_eq!(table.mappings(&mem).len(), 3);
    table.destroy(&mut mem);
    assert_eq!(mem.free_frames(), before);
}

#[test]
fn mappings_report_upper_half_addresses() {
    let mut mem = pool(16);
    let frame = mem.alloc_zeroed().unwrap();
    let mut table = PageTable::new(&mut mem).unwrap();
    let va = usize::MAX - (PAGE_SIZE - 1);
    table.map(&mut mem, va, frame, PAGE_SIZE, RW).unwrap();
    let mappings = table.mappings(&mem);
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].va, va);
    assert_eq!(mappings[0].pa, frame);
}

#[test]
fn address_space_flushes_after_changes() {
    let mut mem = pool(16);
    let tlb = Arc::new(CountingTlb::new());
    let mut space = AddressSpace::new(&mut mem, tlb.clone()).unwrap();
    let frame = mem.alloc_zeroed().unwrap();
    space.map(&mut mem, 0x1000, frame, PAGE_SIZE, RW | PageFlags::OWNED).unwrap();
    assert_eq!(tlb.flushes(), 1);
    assert_eq!(space.unmap(&mut mem, 0x8000, PAGE_SIZE), Ok(0));
    assert_eq!(tlb.flushes(), 1);
    space.unmap(&mut mem, 0x1000, PAGE_SIZE).unwrap();
    assert_eq!(tlb.flushes(), 2);
    space.destroy(&mut mem);
    assert_eq!(tlb.flushes(), 3);
}

#[test]
fn root_allocation_failure_reported() {
    let mut mem = pool(1);
    let _only = mem.alloc_zeroed().unwrap();
    assert_eq!(PageTable::new(&mut mem).err(), Some(MapError::OutOfMemory));
}

proptest! {
    #[test]
    fn map_then_translate(
        vpage in 1usize..(1 << 25),
        pages in 1usize..4,
        offset in 0usize..(4 * PAGE_SIZE),
    ) {
        let mut mem = pool(64);
        let frames: alloc::vec::Vec<usize> = (0..4).map(|_| mem.alloc_zeroed().unwrap()).collect();
        let mut table = PageTable::new(&mut mem).unwrap();
        let va = vpage * PAGE_SIZE;
        let size = pages * PAGE_SIZE;
        // Frames from a fresh pool are contiguous.
        prop_assert_eq!(frames[3] - frames[0], 3 * PAGE_SIZE);
        table.map(&mut mem, va, frames[0], size, RW).unwrap();

        let expected = if offset < size { Some(frames[0] + offset) } else { None };
        prop_assert_eq!(table.translate(&mem, va + offset), expected);
        prop_assert_eq!(table.translate(&mem, va - 1), None);
    }
}
