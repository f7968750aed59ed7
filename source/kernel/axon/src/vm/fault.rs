// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-fault handling: region lookup, pager dispatch and page installation.

use axon_abi::proto::{FillPageReply, FillPageRequest};
use axon_abi::{IpcFlags, PageAttrs};

use crate::ipc::IpcStatus;
use crate::kernel::Kernel;
use crate::mm::{MapError, PageFlags, PAGE_SIZE};
use crate::task::{KernelTask, PendingFault, ThreadState};
use crate::types::{page_align_down, Pid, Tid, VirtAddr};
use crate::vm::{AbortReason, Access, FaultOutcome, Pager};
use crate::Error;

impl Access {
    fn permitted_by_leaf(self, flags: PageFlags) -> bool {
        let needed = match self {
            Access::Read => PageFlags::READ,
            Access::Write => PageFlags::WRITE,
            Access::Execute => PageFlags::EXECUTE,
        };
        flags.contains(needed | PageFlags::USER)
    }
}

impl Kernel {
    /// Models a user memory access by `tid`: resolves through the page table when
    /// a leaf allows it, otherwise takes the fault path.
    pub fn touch(&mut self, tid: Tid, vaddr: VirtAddr, access: Access) -> Result<FaultOutcome, Error> {
        self.ensure_live()?;
        let pid = self.threads.get(tid.as_raw()).ok_or(Error::NotFound)?.pid();
        if let Some((pa, flags)) = self.lookup(pid, vaddr) {
            if access.permitted_by_leaf(flags) {
                return Ok(FaultOutcome::Resolved(pa + vaddr % PAGE_SIZE));
            }
        }
        self.handle_page_fault(tid, vaddr, access)
    }

    /// Handles a fault taken by user thread `tid` at `vaddr`.
    pub fn handle_page_fault(&mut self, tid: Tid, vaddr: VirtAddr, access: Access) -> Result<FaultOutcome, Error> {
        self.ensure_live()?;
        let thread = self.threads.get(tid.as_raw()).ok_or(Error::NotFound)?;
        let pid = thread.pid();
        if pid == self.kernel_pid {
            panic!("page fault in kernel thread {} at {:#x} ({:?})", tid.as_raw(), vaddr, access);
        }
        if !thread.state.is_runnable() {
            return Err(Error::NotRunnable);
        }
        self.make_current(tid);
        log::debug!(target: "vm", "fault: tid={} va={:#x} {:?}", tid.as_raw(), vaddr, access);

        let outcome = self.dispatch_fault(tid, pid, vaddr, access);
        self.run_kernel_threads();
        #[cfg(feature = "debug_invariants")]
        self.assert_invariants();
        Ok(outcome)
    }

    fn dispatch_fault(&mut self, tid: Tid, pid: Pid, vaddr: VirtAddr, access: Access) -> FaultOutcome {
        if vaddr < PAGE_SIZE {
            return self.abort(pid, AbortReason::NullDereference);
        }
        let Some(region) = self.process(pid).and_then(|p| p.regions.find(vaddr)) else {
            return self.abort(pid, AbortReason::NoRegion);
        };
        if !access.permitted_by(region.attrs) {
            return self.abort(pid, AbortReason::ProtectionViolation);
        }
        let (region_start, attrs, pager) = (region.start, region.attrs, region.pager.clone());
        let page = page_align_down(vaddr);
        let offset = vaddr % PAGE_SIZE;

        if let Some((pa, flags)) = self.lookup(pid, page) {
            // Mapped already: the leaf itself forbids this access.
            if access.permitted_by_leaf(flags) {
                return FaultOutcome::Resolved(pa + offset);
            }
            return self.abort(pid, AbortReason::ProtectionViolation);
        }

        let flags = PageFlags::from_attrs(attrs | PageAttrs::USER) | PageFlags::OWNED;
        match pager {
            Pager::File(backing) => {
                let Ok(pa) = self.mem.alloc_zeroed() else {
                    return self.abort(pid, AbortReason::OutOfMemory);
                };
                if let Some(frame) = self.mem.frame_mut(pa) {
                    backing.fill(page - region_start, frame);
                }
                self.install(pid, page, pa, flags, offset)
            }
            Pager::Channel(cid) => {
                let request = FillPageRequest { pid, addr: page as u64 };
                let Some(thread) = self.threads.get_mut(tid.as_raw()) else {
                    return FaultOutcome::Aborted(AbortReason::PagerUnavailable);
                };
                request.encode(&mut thread.buffer);
                thread.task = Some(KernelTask::Fault(PendingFault { page, offset, flags }));
                match self.ipc_from(tid, cid, IpcFlags::CALL | IpcFlags::KERNEL) {
                    Ok(IpcStatus::Blocked) => {
                        log::debug!(target: "vm", "fault: tid={} waiting on pager cid {}", tid.as_raw(), cid.as_raw());
                        FaultOutcome::Pending
                    }
                    Ok(_) => self.complete_fault(tid),
                    Err(err) => {
                        log::warn!(target: "vm", "fault: pager call on cid {} failed: {}", cid.as_raw(), err);
                        self.abort(pid, AbortReason::PagerUnavailable)
                    }
                }
            }
        }
    }

    /// Continuation of a channel-backed fault, run once the pager's reply has been delivered.
    pub(crate) fn resume_fault(&mut self, tid: Tid) {
        let _ = self.complete_fault(tid);
    }

    fn complete_fault(&mut self, tid: Tid) -> FaultOutcome {
        let Some(thread) = self.threads.get_mut(tid.as_raw()) else {
            return FaultOutcome::Aborted(AbortReason::PagerUnavailable);
        };
        let pid = thread.pid();
        let Some(KernelTask::Fault(pending)) = thread.task.take() else {
            return FaultOutcome::Pending;
        };
        if let Some(Err(err)) = thread.result.take() {
            log::warn!(target: "vm", "fault: pid {} lost its pager: {}", pid.as_raw(), err);
            return self.abort(pid, AbortReason::PagerUnavailable);
        }
        let replier = thread.buffer.header.src;
        let reply = match FillPageReply::decode(&thread.buffer) {
            Ok(reply) => reply,
            Err(_) => {
                log::warn!(
                    target: "vm",
                    "fault: bad pager reply label={} for pid {}",
                    thread.buffer.label(),
                    pid.as_raw()
                );
                return self.abort(pid, AbortReason::PagerFailed);
            }
        };
        let Ok(pa) = usize::try_from(reply.paddr) else {
            return self.abort(pid, AbortReason::PagerFailed);
        };
        if self.grants.get(&pa) != Some(&replier) {
            log::warn!(
                target: "vm",
                "fault: pager {} supplied frame {:#x} it does not own",
                replier.as_raw(),
                pa
            );
            return self.abort(pid, AbortReason::PagerFailed);
        }
        self.grants.remove(&pa);

        if let Some((existing, _)) = self.lookup(pid, pending.page) {
            // Another thread of the process resolved the page first.
            self.release_frame(pa);
            self.resume_user(tid);
            return FaultOutcome::Resolved(existing + pending.offset);
        }
        let covered = self.process(pid).and_then(|p| p.regions.find(pending.page)).is_some();
        if !covered {
            self.release_frame(pa);
            return self.abort(pid, AbortReason::NoRegion);
        }
        let outcome = self.install(pid, pending.page, pa, pending.flags, pending.offset);
        if matches!(outcome, FaultOutcome::Resolved(_)) {
            self.resume_user(tid);
        }
        outcome
    }

    /// Maps an owned frame at `page`; the frame is released if mapping fails.
    fn install(&mut self, pid: Pid, page: VirtAddr, pa: usize, flags: PageFlags, offset: usize) -> FaultOutcome {
        let Some(process) = self.processes.get_mut(pid.as_raw()) else {
            self.release_frame(pa);
            return FaultOutcome::Aborted(AbortReason::NoRegion);
        };
        if let Err(err) = process.space.map(&mut self.mem, page, pa, PAGE_SIZE, flags) {
            log::warn!(target: "vm", "fault: map {:#x} -> {:#x} failed: {}", page, pa, err);
            self.release_frame(pa);
            let reason = match err {
                MapError::OutOfMemory => AbortReason::OutOfMemory,
                _ => AbortReason::MappingRejected,
            };
            return self.abort(pid, reason);
        }
        log::debug!(target: "vm", "fault: pid {} mapped {:#x} -> {:#x} {:?}", pid.as_raw(), page, pa, flags);
        FaultOutcome::Resolved(pa + offset)
    }

    fn release_frame(&mut self, pa: usize) {
        if let Err(err) = self.mem.free(pa) {
            panic!("frame {pa:#x} released twice: {err}");
        }
    }

    /// Lets a thread whose fault was resolved continue as a user thread.
    fn resume_user(&mut self, tid: Tid) {
        let running = self.sched.current() == Some(tid);
        let Some(thread) = self.threads.get_mut(tid.as_raw()) else {
            return;
        };
        thread.result = None;
        if running {
            thread.state = ThreadState::Running;
        } else {
            thread.state = ThreadState::Ready;
            self.enqueue_or_die(tid);
        }
    }

    /// Destroys `pid` after an unrecoverable fault.
    pub(crate) fn abort(&mut self, pid: Pid, reason: AbortReason) -> FaultOutcome {
        log::warn!(target: "vm", "aborting process {}: {:?}", pid.as_raw(), reason);
        self.teardown_process(pid);
        FaultOutcome::Aborted(reason)
    }
}
