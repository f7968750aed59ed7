// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frames, Sv39 page tables and address spaces
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysMemory, PageTable, AddressSpace, PageFlags, MapError, FrameError, PAGE_SIZE
//! DEPENDS_ON: hal::Tlb, bitflags
//! INVARIANTS: Table pages live in pool frames; OWNED leaves are freed exactly once; no superpages

pub mod address_space;
pub mod frame;
pub mod page_table;

pub use address_space::AddressSpace;
pub use frame::{FrameError, PhysMemory};
pub use page_table::{is_canonical_sv39, MapError, Mapping, PageFlags, PageTable, PAGE_SIZE};

use axon_abi::PageAttrs;

impl PageFlags {
    /// Leaf flags for a user page with the given region attributes.
    pub fn from_attrs(attrs: PageAttrs) -> Self {
        let mut flags = PageFlags::VALID;
        if attrs.contains(PageAttrs::READABLE) {
            flags |= PageFlags::READ;
        }
        if attrs.contains(PageAttrs::WRITABLE) {
            flags |= PageFlags::WRITE;
        }
        if attrs.contains(PageAttrs::EXECUTABLE) {
            flags |= PageFlags::EXECUTE;
        }
        if attrs.contains(PageAttrs::USER) {
            flags |= PageFlags::USER;
        }
        flags
    }
}

#[cfg(test)]
mod tests;
