// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame pool backing page tables and user pages
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PhysMemory (alloc_zeroed/free/read/write/read_pte/write_pte), FrameError
//! INVARIANTS: Frames are handed out zeroed; a frame is freed at most once; addresses are base + index * PAGE_SIZE

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};

use super::PAGE_SIZE;
use crate::types::{page_align_down, PhysAddr};

/// Errors produced by the frame pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame pool exhausted")]
    OutOfMemory,
    #[error("frame {0:#x} is not allocated")]
    NotAllocated(PhysAddr),
}

/// Fixed pool of page-sized frames starting at `base`.
pub struct PhysMemory {
    base: PhysAddr,
    frames: Vec<Option<Box<[u8]>>>,
    // Stack of free indices; lowest index on top.
    free: Vec<usize>,
    #[cfg(feature = "failpoints")]
    deny_next_alloc: bool,
}

impl PhysMemory {
    pub fn new(base: PhysAddr, count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        frames.resize_with(count, || None);
        Self {
            base,
            frames,
            free: (0..count).rev().collect(),
            #[cfg(feature = "failpoints")]
            deny_next_alloc: false,
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    /// Allocates a zero-filled frame.
    pub fn alloc_zeroed(&mut self) -> Result<PhysAddr, FrameError> {
        #[cfg(feature = "failpoints")]
        if core::mem::take(&mut self.deny_next_alloc) {
            return Err(FrameError::OutOfMemory);
        }
        let index = self.free.pop().ok_or(FrameError::OutOfMemory)?;
        self.frames[index] = Some(vec![0u8; PAGE_SIZE].into_boxed_slice());
        Ok(self.base + index * PAGE_SIZE)
    }

    /// Returns a frame to the pool.
    pub fn free(&mut self, pa: PhysAddr) -> Result<(), FrameError> {
        let index = self.index(pa).ok_or(FrameError::NotAllocated(pa))?;
        if pa % PAGE_SIZE != 0 || self.frames[index].take().is_none() {
            return Err(FrameError::NotAllocated(pa));
        }
        self.free.push(index);
        Ok(())
    }

    pub fn is_allocated(&self, pa: PhysAddr) -> bool {
        self.frame(pa).is_some()
    }

    /// Contents of the frame starting at `pa`.
    pub fn frame(&self, pa: PhysAddr) -> Option<&[u8]> {
        if pa % PAGE_SIZE != 0 {
            return None;
        }
        let index = self.index(pa)?;
        self.frames[index].as_deref()
    }

    pub fn frame_mut(&mut self, pa: PhysAddr) -> Option<&mut [u8]> {
        if pa % PAGE_SIZE != 0 {
            return None;
        }
        let index = self.index(pa)?;
        self.frames[index].as_deref_mut()
    }

    /// Copies bytes starting at `pa` into `buf`; may span frames.
    pub fn read(&self, pa: PhysAddr, buf: &mut [u8]) -> Result<(), FrameError> {
        let mut done = 0;
        while done < buf.len() {
            let at = pa + done;
            let frame = self.frame(page_align_down(at)).ok_or(FrameError::NotAllocated(at))?;
            let offset = at % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&frame[offset..offset + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `data` to memory starting at `pa`; may span frames.
    pub fn write(&mut self, pa: PhysAddr, data: &[u8]) -> Result<(), FrameError> {
        let mut done = 0;
        while done < data.len() {
            let at = pa + done;
            let frame =
                self.frame_mut(page_align_down(at)).ok_or(FrameError::NotAllocated(at))?;
            let offset = at % PAGE_SIZE;
            let n = (PAGE_SIZE - offset).min(data.len() - done);
            frame[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Reads a little-endian page-table entry.
    pub fn read_pte(&self, pa: PhysAddr) -> Option<u64> {
        let mut raw = [0u8; 8];
        self.read(pa, &mut raw).ok()?;
        Some(u64::from_le_bytes(raw))
    }

    pub fn write_pte(&mut self, pa: PhysAddr, entry: u64) -> Result<(), FrameError> {
        self.write(pa, &entry.to_le_bytes())
    }

    /// Makes the next `alloc_zeroed` fail with `OutOfMemory`.
    #[cfg(feature = "failpoints")]
    pub fn fail_next_alloc(&mut self) {
        self.deny_next_alloc = true;
    }

    fn index(&self, pa: PhysAddr) -> Option<usize> {
        let index = pa.checked_sub(self.base)? / PAGE_SIZE;
        (index < self.frames.len()).then_some(index)
    }
}

impl core::fmt::Debug for PhysMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysMemory")
            .field("base", &format_args!("{:#x}", self.base))
            .field("total", &self.total_frames())
            .field("free", &self.free_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x8000_0000;

    #[test]
    fn frames_are_zeroed_and_reused() {
        let mut mem = PhysMemory::new(BASE, 2);
        let a = mem.alloc_zeroed().unwrap();
        assert_eq!(a, BASE);
        mem.write(a + 8, &[0xaa; 4]).unwrap();
        mem.free(a).unwrap();
        let b = mem.alloc_zeroed().unwrap();
        assert_eq!(b, a);
        assert!(mem.frame(b).unwrap().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn exhaustion_and_double_free() {
        let mut mem = PhysMemory::new(BASE, 1);
        let a = mem.alloc_zeroed().unwrap();
        assert_eq!(mem.alloc_zeroed(), Err(FrameError::OutOfMemory));
        mem.free(a).unwrap();
        assert_eq!(mem.free(a), Err(FrameError::NotAllocated(a)));
        assert_eq!(mem.free(BASE + 5 * PAGE_SIZE), Err(FrameError::NotAllocated(BASE + 5 * PAGE_SIZE)));
    }

    #[test]
    fn access_spans_adjacent_frames() {
        let mut mem = PhysMemory::new(BASE, 2);
        let a = mem.alloc_zeroed().unwrap();
        let _b = mem.alloc_zeroed().unwrap();
        mem.write(a + PAGE_SIZE - 2, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        mem.read(a + PAGE_SIZE - 2, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(mem.read_pte(BASE + 3 * PAGE_SIZE), None);
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failpoint_denies_one_allocation() {
        let mut mem = PhysMemory::new(BASE, 4);
        mem.fail_next_alloc();
        assert_eq!(mem.alloc_zeroed(), Err(FrameError::OutOfMemory));
        assert!(mem.alloc_zeroed().is_ok());
    }
}
