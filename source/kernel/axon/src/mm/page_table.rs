// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page table stored in pool frames, with lazy allocation of intermediate levels.

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;

use super::frame::PhysMemory;
use crate::types::{page_align_down, PhysAddr, VirtAddr};

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = axon_abi::PAGE_SIZE;
/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
const PTE_SIZE: usize = 8;
const LEVELS: usize = 3;
const PPN_MASK: u64 = (1 << 44) - 1;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software bit: the frame belongs to this mapping and is freed with it.
        const OWNED = 1 << 8;
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("address not page aligned")]
    Unaligned,
    #[error("range outside the canonical Sv39 space")]
    OutOfRange,
    #[error("mapping violates W^X")]
    PermissionDenied,
    #[error("page already mapped")]
    AlreadyMapped,
    #[error("flags do not describe a valid leaf")]
    InvalidFlags,
    #[error("empty range")]
    EmptyRange,
    #[error("no frame for an intermediate table")]
    OutOfMemory,
}

/// A leaf entry as reported by [`PageTable::mappings`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub va: VirtAddr,
    pub pa: PhysAddr,
    pub flags: PageFlags,
}

/// Three-level Sv39 page table. Table pages are frames of a [`PhysMemory`].
#[derive(Debug)]
pub struct PageTable {
    root: PhysAddr,
    tables: usize,
}

impl PageTable {
    /// Allocates a zeroed root page.
    pub fn new(mem: &mut PhysMemory) -> Result<Self, MapError> {
        let root = mem.alloc_zeroed().map_err(|_| MapError::OutOfMemory)?;
        Ok(Self { root, tables: 1 })
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root / PAGE_SIZE
    }

    /// Frames currently used for table pages, root included.
    pub fn table_frames(&self) -> usize {
        self.tables
    }

    /// Leaf mapping the page that contains `va`.
    pub fn lookup(&self, mem: &PhysMemory, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        if !is_canonical_sv39(va) {
            return None;
        }
        let slot = self.leaf_slot(mem, page_align_down(va))?;
        let entry = read_entry(mem, slot);
        if entry & PageFlags::VALID.bits() == 0 {
            return None;
        }
        Some((pte_addr(entry), PageFlags::from_bits_truncate(entry)))
    }

    /// Physical address backing `va`, page offset included.
    pub fn translate(&self, mem: &PhysMemory, va: VirtAddr) -> Option<PhysAddr> {
        self.lookup(mem, va).map(|(pa, _)| pa + va % PAGE_SIZE)
    }

    /// Maps `size` bytes at `va` to `pa`.
    ///
    /// The whole range is checked for existing mappings before any entry is
    /// written; a failing table allocation rolls back the entries written so far.
    pub fn map(
        &mut self,
        mem: &mut PhysMemory,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        check_range(va, size)?;
        if pa % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if pa.checked_add(size).is_none() {
            return Err(MapError::OutOfRange);
        }
        check_leaf_flags(flags)?;

        let pages = size / PAGE_SIZE;
        for page in 0..pages {
            if self.lookup(mem, va + page * PAGE_SIZE).is_some() {
                return Err(MapError::AlreadyMapped);
            }
        }
        for page in 0..pages {
            let slot = match self.leaf_slot_alloc(mem, va + page * PAGE_SIZE) {
                Ok(slot) => slot,
                Err(err) => {
                    self.clear(mem, va, page);
                    return Err(err);
                }
            };
            write_entry(mem, slot, make_pte(pa + page * PAGE_SIZE, flags));
        }
        Ok(())
    }

    /// Removes every leaf in `[va, va + size)`, freeing owned frames.
    /// Returns the number of pages that were mapped.
    pub fn unmap(&mut self, mem: &mut PhysMemory, va: VirtAddr, size: usize) -> Result<usize, MapError> {
        check_range(va, size)?;
        let mut removed = 0;
        for page in 0..size / PAGE_SIZE {
            let Some(slot) = self.leaf_slot(mem, va + page * PAGE_SIZE) else {
                continue;
            };
            let entry = read_entry(mem, slot);
            if entry & PageFlags::VALID.bits() == 0 {
                continue;
            }
            release_leaf(mem, entry);
            write_entry(mem, slot, 0);
            removed += 1;
        }
        Ok(removed)
    }

    /// Frees owned leaf frames and every table page. Returns the number of frames released.
    pub fn destroy(self, mem: &mut PhysMemory) -> usize {
        free_table(mem, self.root, LEVELS - 1)
    }

    /// All leaves in ascending virtual address order.
    pub fn mappings(&self, mem: &PhysMemory) -> Vec<Mapping> {
        let mut out = Vec::new();
        collect(mem, self.root, LEVELS - 1, 0, &mut out);
        out
    }

    fn leaf_slot(&self, mem: &PhysMemory, va: VirtAddr) -> Option<PhysAddr> {
        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let entry = read_entry(mem, table + indices[level] * PTE_SIZE);
            if entry & PageFlags::VALID.bits() == 0 {
                return None;
            }
            if entry & LEAF_PERMS.bits() != 0 {
                panic!("superpage entry at level {level} for {va:#x}");
            }
            table = pte_addr(entry);
        }
        Some(table + indices[0] * PTE_SIZE)
    }

    fn leaf_slot_alloc(&mut self, mem: &mut PhysMemory, va: VirtAddr) -> Result<PhysAddr, MapError> {
        let indices = vpn_indices(va);
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let slot = table + indices[level] * PTE_SIZE;
            let entry = read_entry(mem, slot);
            if entry & PageFlags::VALID.bits() != 0 {
                if entry & LEAF_PERMS.bits() != 0 {
                    panic!("superpage entry at level {level} for {va:#x}");
                }
                table = pte_addr(entry);
                continue;
            }
            let next = mem.alloc_zeroed().map_err(|_| MapError::OutOfMemory)?;
            write_entry(mem, slot, make_pte(next, PageFlags::VALID));
            self.tables += 1;
            table = next;
        }
        Ok(table + indices[0] * PTE_SIZE)
    }

    fn clear(&mut self, mem: &mut PhysMemory, va: VirtAddr, pages: usize) {
        for page in 0..pages {
            if let Some(slot) = self.leaf_slot(mem, va + page * PAGE_SIZE) {
                write_entry(mem, slot, 0);
            }
        }
    }
}

fn check_range(va: VirtAddr, size: usize) -> Result<(), MapError> {
    if size == 0 {
        return Err(MapError::EmptyRange);
    }
    if va % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }
    let last = va.checked_add(size - 1).ok_or(MapError::OutOfRange)?;
    if !is_canonical_sv39(va) || !is_canonical_sv39(last) || (va >> 38) & 1 != (last >> 38) & 1 {
        return Err(MapError::OutOfRange);
    }
    Ok(())
}

fn check_leaf_flags(flags: PageFlags) -> Result<(), MapError> {
    if !flags.contains(PageFlags::VALID) || flags.intersection(LEAF_PERMS).is_empty() {
        return Err(MapError::InvalidFlags);
    }
    // W without R is a reserved encoding.
    if flags.contains(PageFlags::WRITE) && !flags.contains(PageFlags::READ) {
        return Err(MapError::InvalidFlags);
    }
    if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
        return Err(MapError::PermissionDenied);
    }
    Ok(())
}

fn release_leaf(mem: &mut PhysMemory, entry: u64) {
    if entry & PageFlags::OWNED.bits() != 0 {
        let frame = pte_addr(entry);
        if mem.free(frame).is_err() {
            panic!("owned leaf points at unallocated frame {frame:#x}");
        }
    }
}

fn free_table(mem: &mut PhysMemory, table: PhysAddr, level: usize) -> usize {
    let mut released = 0;
    for index in 0..PT_ENTRIES {
        let entry = read_entry(mem, table + index * PTE_SIZE);
        if entry & PageFlags::VALID.bits() == 0 {
            continue;
        }
        if level == 0 {
            if entry & PageFlags::OWNED.bits() != 0 {
                released += 1;
            }
            release_leaf(mem, entry);
        } else {
            released += free_table(mem, pte_addr(entry), level - 1);
        }
    }
    if mem.free(table).is_err() {
        panic!("page table page {table:#x} already freed");
    }
    released + 1
}

fn collect(mem: &PhysMemory, table: PhysAddr, level: usize, prefix: usize, out: &mut Vec<Mapping>) {
    for index in 0..PT_ENTRIES {
        let entry = read_entry(mem, table + index * PTE_SIZE);
        if entry & PageFlags::VALID.bits() == 0 {
            continue;
        }
        let va = prefix | index << (12 + 9 * level);
        if level == 0 {
            out.push(Mapping {
                va: sign_extend(va),
                pa: pte_addr(entry),
                flags: PageFlags::from_bits_truncate(entry),
            });
        } else {
            collect(mem, pte_addr(entry), level - 1, va, out);
        }
    }
}

fn read_entry(mem: &PhysMemory, slot: PhysAddr) -> u64 {
    match mem.read_pte(slot) {
        Some(entry) => entry,
        None => panic!("page table slot {slot:#x} lies in an unallocated frame"),
    }
}

fn write_entry(mem: &mut PhysMemory, slot: PhysAddr, entry: u64) {
    if mem.write_pte(slot, entry).is_err() {
        panic!("page table slot {slot:#x} lies in an unallocated frame");
    }
}

fn make_pte(pa: PhysAddr, flags: PageFlags) -> u64 {
    (((pa / PAGE_SIZE) as u64) << 10) | flags.bits()
}

fn pte_addr(entry: u64) -> PhysAddr {
    (((entry >> 10) & PPN_MASK) as usize) * PAGE_SIZE
}

fn sign_extend(va: usize) -> usize {
    if (va >> 38) & 1 == 1 {
        va | !((1usize << 39) - 1)
    } else {
        va
    }
}

fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn0 = (va >> 12) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn2 = (va >> 30) & 0x1ff;
    [vpn0, vpn1, vpn2]
}

pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
