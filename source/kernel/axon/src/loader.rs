// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: ELF64 program loader for the initial user programs
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::load_elf(pid, image), Kernel::spawn_program(name, image), LoadedImage, LoadError
//! DEPENDS_ON: vm (file-backed regions), task (process/thread creation)
//! INVARIANTS: Nothing is mapped eagerly; every PT_LOAD becomes a file-backed region populated on first touch

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use axon_abi::PageAttrs;

use crate::kernel::Kernel;
use crate::mm::PAGE_SIZE;
use crate::types::{page_align_down, page_align_up, Pid, Tid, VirtAddr};
use crate::vm::{attrs_admissible, FileBacking, Pager, Region};
use crate::Error;

/// Top of the initial user stack; the stack region ends here.
pub const USER_STACK_TOP: VirtAddr = 0x4010_0000;
/// Pages reserved for the initial stack.
pub const USER_STACK_PAGES: usize = 4;

const EHDR_LEN: usize = 64;
const PHDR_LEN: usize = 56;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Errors surfaced while loading a user ELF image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// Input was shorter than required for the ELF header or program headers.
    #[error("image truncated")]
    Truncated,
    /// ELF magic was not present.
    #[error("not an ELF image")]
    InvalidElf,
    /// ELF class was not 64-bit.
    #[error("not ELF64")]
    WrongClass,
    /// ELF encoding was not little-endian.
    #[error("not little endian")]
    WrongEndian,
    /// Program header table fields were out of range.
    #[error("bad program header table")]
    BadPhTable,
    /// Segment bounds were invalid or overflowed.
    #[error("segment out of range")]
    SegmentOutOfRange,
    /// Segment asks for writable and executable memory, write without read, or no access at all.
    #[error("segment permissions rejected")]
    PermissionDenied,
    /// Segment touches the first page.
    #[error("segment maps page zero")]
    NullSegment,
}

/// Where a loaded program starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: VirtAddr,
    pub stack_top: VirtAddr,
}

#[derive(Clone, Copy, Debug)]
struct Segment {
    start: VirtAddr,
    size: usize,
    file_offset: usize,
    file_len: usize,
    attrs: PageAttrs,
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn to_usize(raw: u64) -> Result<usize, LoadError> {
    usize::try_from(raw).map_err(|_| LoadError::SegmentOutOfRange)
}

/// Parses the header and the `PT_LOAD` segments of `bytes`.
fn parse(bytes: &[u8]) -> Result<(VirtAddr, Vec<Segment>), LoadError> {
    if bytes.len() < EHDR_LEN {
        return Err(LoadError::Truncated);
    }
    if &bytes[0..4] != b"\x7FELF" {
        return Err(LoadError::InvalidElf);
    }
    if bytes[4] != 2 {
        return Err(LoadError::WrongClass);
    }
    if bytes[5] != 1 {
        return Err(LoadError::WrongEndian);
    }
    let entry = to_usize(le_u64(&bytes[24..32]))?;
    let phoff = usize::try_from(le_u64(&bytes[32..40])).map_err(|_| LoadError::BadPhTable)?;
    let phentsize = usize::from(le_u16(&bytes[54..56]));
    let phnum = usize::from(le_u16(&bytes[56..58]));
    if phnum > 0 && phentsize < PHDR_LEN {
        return Err(LoadError::BadPhTable);
    }
    let table_end = phentsize
        .checked_mul(phnum)
        .and_then(|len| phoff.checked_add(len))
        .ok_or(LoadError::BadPhTable)?;
    if table_end > bytes.len() {
        return Err(LoadError::Truncated);
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let ph = &bytes[phoff + i * phentsize..][..PHDR_LEN];
        if le_u32(&ph[0..4]) != PT_LOAD {
            continue;
        }
        let p_flags = le_u32(&ph[4..8]);
        let p_offset = to_usize(le_u64(&ph[8..16]))?;
        let p_vaddr = to_usize(le_u64(&ph[16..24]))?;
        let p_filesz = to_usize(le_u64(&ph[32..40]))?;
        let p_memsz = to_usize(le_u64(&ph[40..48]))?;
        if p_memsz == 0 {
            continue;
        }
        if p_filesz > p_memsz {
            return Err(LoadError::SegmentOutOfRange);
        }
        let file_end = p_offset.checked_add(p_filesz).ok_or(LoadError::SegmentOutOfRange)?;
        if file_end > bytes.len() {
            return Err(LoadError::Truncated);
        }

        let start = page_align_down(p_vaddr);
        if start < PAGE_SIZE {
            return Err(LoadError::NullSegment);
        }
        let end = p_vaddr
            .checked_add(p_memsz)
            .and_then(page_align_up)
            .ok_or(LoadError::SegmentOutOfRange)?;
        // File bytes before p_vaddr in the first page come along with the segment.
        let lead = p_vaddr - start;
        let file_offset = p_offset.checked_sub(lead).ok_or(LoadError::SegmentOutOfRange)?;

        let mut attrs = PageAttrs::USER;
        if p_flags & PF_R != 0 {
            attrs |= PageAttrs::READABLE;
        }
        if p_flags & PF_W != 0 {
            attrs |= PageAttrs::WRITABLE;
        }
        if p_flags & PF_X != 0 {
            attrs |= PageAttrs::EXECUTABLE;
        }
        if !attrs_admissible(attrs) {
            return Err(LoadError::PermissionDenied);
        }
        segments.push(Segment {
            start,
            size: end - start,
            file_offset,
            file_len: if p_filesz == 0 { 0 } else { p_filesz + lead },
            attrs,
        });
    }
    Ok((entry, segments))
}

impl Kernel {
    /// Registers the segments of `image` and a zero-filled stack in `pid`.
    /// On failure every region added by this call is removed again.
    pub fn load_elf(&mut self, pid: Pid, image: Arc<[u8]>) -> Result<LoadedImage, Error> {
        self.ensure_live()?;
        if self.process(pid).is_none() {
            return Err(Error::NotFound);
        }
        let (entry, segments) = parse(&image)?;
        let mut added = Vec::with_capacity(segments.len() + 1);
        if let Err(err) = self.register_image(pid, &image, &segments, &mut added) {
            for start in added {
                // Fresh file-backed regions: nothing mapped, no channel reference.
                let _ = self.region_remove(pid, start);
            }
            return Err(err);
        }
        log::info!(
            target: "loader",
            "pid {} loaded: entry={:#x} segments={}",
            pid.as_raw(),
            entry,
            segments.len()
        );
        Ok(LoadedImage { entry, stack_top: USER_STACK_TOP })
    }

    fn register_image(
        &mut self,
        pid: Pid,
        image: &Arc<[u8]>,
        segments: &[Segment],
        added: &mut Vec<VirtAddr>,
    ) -> Result<(), Error> {
        for segment in segments {
            let backing = FileBacking::new(image.clone(), segment.file_offset, segment.file_len)?;
            let region = Region::new(segment.start, segment.size, segment.attrs, Pager::File(backing))?;
            self.region_add(pid, region)?;
            added.push(segment.start);
            log::debug!(
                target: "loader",
                "pid {} segment [{:#x}, {:#x}) {:?}",
                pid.as_raw(),
                segment.start,
                segment.start + segment.size,
                segment.attrs
            );
        }

        let stack_size = USER_STACK_PAGES * PAGE_SIZE;
        let stack = Region::new(
            USER_STACK_TOP - stack_size,
            stack_size,
            PageAttrs::READABLE | PageAttrs::WRITABLE | PageAttrs::USER,
            Pager::File(FileBacking::zeroed()),
        )?;
        self.region_add(pid, stack)?;
        added.push(USER_STACK_TOP - stack_size);
        Ok(())
    }

    /// Creates a process running `image`: load, then create and resume its first thread.
    pub fn spawn_program(&mut self, name: &str, image: Arc<[u8]>) -> Result<(Pid, Tid), Error> {
        let pid = self.process_create(name)?;
        let started = self.load_elf(pid, image).and_then(|loaded| {
            let tid = self.thread_create(pid, loaded.entry, loaded.stack_top, 0, 0)?;
            self.thread_resume(tid)?;
            Ok(tid)
        });
        match started {
            Ok(tid) => Ok((pid, tid)),
            Err(err) => {
                log::warn!(target: "loader", "spawn of '{}' failed: {}", name, err);
                self.teardown_process(pid);
                Err(err)
            }
        }
    }
}
