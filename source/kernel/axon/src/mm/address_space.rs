// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address space: a page table plus TLB maintenance
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace (new/map/unmap/lookup/translate/destroy)
//! DEPENDS_ON: mm::page_table, mm::frame, hal::Tlb
//! INVARIANTS: Every successful map/unmap and the final teardown flush the TLB

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use super::frame::PhysMemory;
use super::page_table::{MapError, Mapping, PageFlags, PageTable};
use crate::hal::Tlb;
use crate::types::{PhysAddr, VirtAddr};

pub struct AddressSpace {
    table: PageTable,
    tlb: Arc<dyn Tlb>,
}

impl AddressSpace {
    pub fn new(mem: &mut PhysMemory, tlb: Arc<dyn Tlb>) -> Result<Self, MapError> {
        Ok(Self { table: PageTable::new(mem)?, tlb })
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn map(
        &mut self,
        mem: &mut PhysMemory,
        va: VirtAddr,
        pa: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.table.map(mem, va, pa, size, flags)?;
        self.tlb.flush_all();
        Ok(())
    }

    pub fn unmap(&mut self, mem: &mut PhysMemory, va: VirtAddr, size: usize) -> Result<usize, MapError> {
        let removed = self.table.unmap(mem, va, size)?;
        if removed > 0 {
            self.tlb.flush_all();
        }
        Ok(removed)
    }

    pub fn lookup(&self, mem: &PhysMemory, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.table.lookup(mem, va)
    }

    pub fn translate(&self, mem: &PhysMemory, va: VirtAddr) -> Option<PhysAddr> {
        self.table.translate(mem, va)
    }

    pub fn mappings(&self, mem: &PhysMemory) -> Vec<Mapping> {
        self.table.mappings(mem)
    }

    /// Releases the table and owned frames. Returns the number of frames freed.
    pub fn destroy(self, mem: &mut PhysMemory) -> usize {
        let released = self.table.destroy(mem);
        self.tlb.flush_all();
        released
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace").field("root", &format_args!("{:#x}", self.table.root())).finish()
    }
}
