// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identifier newtypes and address helpers shared by every subsystem
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, Tid, Cid, ChannelRef, PhysAddr, VirtAddr, page_align_down/up
//! DEPENDS_ON: axon-abi ids, mm::PAGE_SIZE

use core::fmt;

pub use axon_abi::{Cid, Pid, Tid};

use crate::mm::PAGE_SIZE;

/// Physical address inside the frame pool.
pub type PhysAddr = usize;
/// User virtual address.
pub type VirtAddr = usize;

/// Kernel-wide name of a channel: channel ids are only unique per process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelRef {
    pub pid: Pid,
    pub cid: Cid,
}

impl ChannelRef {
    pub const fn new(pid: Pid, cid: Cid) -> Self {
        Self { pid, cid }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid.as_raw(), self.cid.as_raw())
    }
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr % PAGE_SIZE == 0
}

#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// `None` on overflow.
#[inline]
pub const fn page_align_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}
