// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Registry consistency checks.

extern crate alloc;

use alloc::format;
use alloc::string::String;

use crate::kernel::Kernel;
use crate::task::{RecvSource, ThreadState};
use crate::types::{ChannelRef, Cid};

/// A broken registry invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{invariant}: {description}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub description: String,
}

fn violation(invariant: &'static str, description: String) -> Result<(), InvariantViolation> {
    Err(InvariantViolation { invariant, description })
}

/// Walks the registry and reports the first inconsistency.
pub fn check(kernel: &Kernel) -> Result<(), InvariantViolation> {
    for (id, thread) in kernel.threads.iter() {
        let Some(process) = kernel.process(thread.pid()) else {
            return violation("thread-owner", format!("tid {id} belongs to missing pid {}", thread.pid().as_raw()));
        };
        if !process.threads().contains(&thread.tid()) {
            return violation("thread-owner", format!("tid {id} not listed by pid {}", thread.pid().as_raw()));
        }
    }

    for (pid_raw, process) in kernel.processes.iter() {
        let pid = process.pid();
        for (cid_raw, channel) in process.channels.iter() {
            let this = ChannelRef::new(pid, Cid::from_raw(cid_raw as i32));
            if let Some(peer) = channel.linked_to {
                match kernel.channel(peer) {
                    Some(peer_channel) if peer_channel.linked_to == Some(this) => {}
                    _ => return violation("link-symmetry", format!("{this} -> {peer} is one-sided")),
                }
            }
            for &tid in &channel.receivers {
                let expected = ThreadState::BlockedRecv(RecvSource::Channel(this.cid));
                if kernel.thread(tid).map(|t| t.state()) != Some(expected) {
                    return violation("wait-queue", format!("receiver tid {} on {this} is not blocked there", tid.as_raw()));
                }
            }
            for &tid in &channel.senders {
                if kernel.thread(tid).map(|t| t.state()) != Some(ThreadState::BlockedSend(this)) {
                    return violation("wait-queue", format!("sender tid {} on {this} is not blocked there", tid.as_raw()));
                }
            }
        }
        for &tid in &process.any_receivers {
            let expected = ThreadState::BlockedRecv(RecvSource::Any);
            if kernel.thread(tid).map(|t| t.state()) != Some(expected) {
                return violation("wait-queue", format!("tid {} queued on ANY of pid {pid_raw} is not blocked", tid.as_raw()));
            }
        }
        let mut previous_end = 0;
        for region in process.regions.iter() {
            if region.start < previous_end {
                return violation("region-overlap", format!("pid {pid_raw} region at {:#x} overlaps", region.start));
            }
            previous_end = region.end;
        }
    }

    for (&pa, owner) in &kernel.grants {
        if !kernel.mem.is_allocated(pa) {
            return violation("grant", format!("frame {pa:#x} granted to pid {} is free", owner.as_raw()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelConfig;

    #[test]
    fn fresh_kernel_is_consistent() {
        let mut kernel = Kernel::new(KernelConfig::new()).unwrap();
        kernel.process_create("a").unwrap();
        assert_eq!(check(&kernel), Ok(()));
    }

    #[test]
    fn detects_one_sided_link() {
        let mut kernel = Kernel::new(KernelConfig::new()).unwrap();
        let pid = kernel.process_create("a").unwrap();
        let cid = kernel.channel_create(pid).unwrap();
        let other = kernel.channel_create(pid).unwrap();
        kernel.channel_mut(ChannelRef::new(pid, cid)).unwrap().linked_to = Some(ChannelRef::new(pid, other));
        let err = check(&kernel).unwrap_err();
        assert_eq!(err.invariant, "link-symmetry");
    }

    #[test]
    fn detects_granted_free_frame() {
        let mut kernel = Kernel::new(KernelConfig::new()).unwrap();
        let pid = kernel.process_create("a").unwrap();
        let pa = kernel.mem.alloc_zeroed().unwrap();
        kernel.grants.insert(pa, pid);
        assert_eq!(check(&kernel), Ok(()));
        kernel.mem.free(pa).unwrap();
        assert_eq!(check(&kernel).unwrap_err().invariant, "grant");
    }
}
