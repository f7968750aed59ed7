// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory regions and the page-fault / external-pager protocol
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Region, RegionList, Pager, FileBacking, Access, FaultOutcome, AbortReason
//! DEPENDS_ON: mm (page tables, frames), ipc (kernel-originated calls), task (abort)
//! INVARIANTS: Regions of one address space never overlap; faults below the first page always abort

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use axon_abi::PageAttrs;

use crate::mm::PAGE_SIZE;
use crate::types::{is_page_aligned, Cid, PhysAddr, VirtAddr};

mod fault;


/// Errors produced when editing a region list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region bounds not page aligned")]
    Unaligned,
    #[error("empty or wrapping region")]
    Empty,
    #[error("region overlaps an existing one")]
    Overlap,
    #[error("file range exceeds the image")]
    ImageBounds,
    #[error("no region starts there")]
    NotFound,
}

/// Bytes of a program image backing a region.
#[derive(Clone)]
pub struct FileBacking {
    image: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl FileBacking {
    /// `len` bytes of `image` starting at `offset` back the start of the region;
    /// the rest of the region reads as zero.
    pub fn new(image: Arc<[u8]>, offset: usize, len: usize) -> Result<Self, RegionError> {
        let end = offset.checked_add(len).ok_or(RegionError::ImageBounds)?;
        if end > image.len() {
            return Err(RegionError::ImageBounds);
        }
        Ok(Self { image, offset, len })
    }

    /// Backing with no file bytes: every page is zero filled.
    pub fn zeroed() -> Self {
        Self { image: Arc::from(Vec::new()), offset: 0, len: 0 }
    }

    /// Copies the file bytes of the page at `region_offset` into `page`.
    /// Bytes past the file size are left untouched; the caller hands in a zeroed frame.
    pub fn fill(&self, region_offset: usize, page: &mut [u8]) {
        if region_offset >= self.len {
            return;
        }
        let n = (self.len - region_offset).min(page.len());
        let src = self.offset + region_offset;
        page[..n].copy_from_slice(&self.image[src..src + n]);
    }

    pub fn file_len(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("image_len", &self.image.len())
            .finish()
    }
}

/// Source of the pages of a region.
#[derive(Debug, Clone)]
pub enum Pager {
    /// External pager reached through a channel of the owning process.
    Channel(Cid),
    /// Kernel-resolved pages copied from an image.
    File(FileBacking),
}

#[derive(Debug, Clone)]
pub struct Region {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub attrs: PageAttrs,
    pub pager: Pager,
}

impl Region {
    pub fn new(start: VirtAddr, size: usize, attrs: PageAttrs, pager: Pager) -> Result<Self, RegionError> {
        if !is_page_aligned(start) || !is_page_aligned(size) {
            return Err(RegionError::Unaligned);
        }
        let end = start.checked_add(size).ok_or(RegionError::Empty)?;
        if size == 0 {
            return Err(RegionError::Empty);
        }
        Ok(Self { start, end, attrs, pager })
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.start <= va && va < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn pages(&self) -> usize {
        self.len() / PAGE_SIZE
    }
}

/// Regions of one address space, sorted by start address.
#[derive(Debug, Default)]
pub struct RegionList {
    regions: Vec<Region>,
}

impl RegionList {
    pub const fn new() -> Self {
        Self { regions: Vec::new() }
    }

    pub fn add(&mut self, region: Region) -> Result<(), RegionError> {
        if region.is_empty() {
            return Err(RegionError::Empty);
        }
        if self.regions.iter().any(|r| r.start < region.end && region.start < r.end) {
            return Err(RegionError::Overlap);
        }
        let at = self.regions.partition_point(|r| r.start < region.start);
        self.regions.insert(at, region);
        Ok(())
    }

    pub fn find(&self, va: VirtAddr) -> Option<&Region> {
        let at = self.regions.partition_point(|r| r.start <= va);
        at.checked_sub(1).map(|i| &self.regions[i]).filter(|r| r.contains(va))
    }

    /// Removes the region starting exactly at `start`.
    pub fn remove(&mut self, start: VirtAddr) -> Result<Region, RegionError> {
        let at = self.regions.iter().position(|r| r.start == start).ok_or(RegionError::NotFound)?;
        Ok(self.regions.remove(at))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Access combinations a region may carry: some access, never W+X, and W only together with R.
pub fn attrs_admissible(attrs: PageAttrs) -> bool {
    let access = PageAttrs::READABLE | PageAttrs::WRITABLE | PageAttrs::EXECUTABLE;
    attrs.intersects(access)
        && !attrs.contains(PageAttrs::WRITABLE | PageAttrs::EXECUTABLE)
        && (!attrs.contains(PageAttrs::WRITABLE) || attrs.contains(PageAttrs::READABLE))
}

/// Kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    pub fn permitted_by(self, attrs: PageAttrs) -> bool {
        match self {
            Access::Read => attrs.contains(PageAttrs::READABLE),
            Access::Write => attrs.contains(PageAttrs::WRITABLE),
            Access::Execute => attrs.contains(PageAttrs::EXECUTABLE),
        }
    }
}

/// Why a process was killed by the fault path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Access below the first page.
    NullDereference,
    /// No region covers the address.
    NoRegion,
    /// The region or the installed page forbids this access.
    ProtectionViolation,
    /// The pager channel is missing, unlinked or its peer died.
    PagerUnavailable,
    /// The pager answered with an error, a malformed reply or a frame it does not own.
    PagerFailed,
    /// No frame for the page or one of its page-table levels.
    OutOfMemory,
    /// The page table refused the mapping.
    MappingRejected,
}

/// Result of handling one page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The access can proceed; physical address of the faulting byte.
    Resolved(PhysAddr),
    /// The thread waits for its pager.
    Pending,
    /// The owning process was destroyed.
    Aborted(AbortReason),
}
