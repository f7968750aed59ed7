// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state aggregate and the entry-point plumbing shared by all subsystems
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel (new/with_hal, lookups, schedule), HaltReason
//! DEPENDS_ON: mm, task, sched, ipc, server, hal
//! INVARIANTS: Kernel threads run to their next suspension before any entry point returns

extern crate alloc;

use alloc::{collections::BTreeMap, collections::VecDeque, sync::Arc};
use core::marker::PhantomData;

use axon_abi::{IpcFlags, Message};

use crate::config::KernelConfig;
use crate::hal::{CaptureConsole, Console, CountingTlb, Tlb};
use crate::idtable::IdTable;
use crate::ipc::IpcStatus;
use crate::mm::{PageFlags, PhysMemory};
use crate::sched::{EnqueueOutcome, Scheduler};
use crate::server::ServerTable;
use crate::task::{Channel, KernelTask, Process, Thread, ThreadState};
use crate::types::{ChannelRef, Cid, PhysAddr, Pid, Tid, VirtAddr};
use crate::Error;

/// Why the kernel stopped serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// A test harness asked for shutdown via `EXIT_KERNEL_TEST`.
    TestExit,
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) mem: PhysMemory,
    pub(crate) processes: IdTable<Process>,
    pub(crate) threads: IdTable<Thread>,
    pub(crate) sched: Scheduler,
    /// Woken threads with a pending kernel continuation, in wake-up order.
    pub(crate) kernel_work: VecDeque<Tid>,
    /// Frames handed to pagers and not yet installed.
    pub(crate) grants: BTreeMap<PhysAddr, Pid>,
    pub(crate) server: ServerTable,
    pub(crate) console: Arc<dyn Console>,
    pub(crate) tlb: Arc<dyn Tlb>,
    pub(crate) kernel_pid: Pid,
    pub(crate) server_tid: Tid,
    pub(crate) halted: Option<HaltReason>,
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(Kernel: Send, Sync);

impl Kernel {
    /// Boots a kernel with host console and TLB stand-ins.
    pub fn new(config: KernelConfig) -> Result<Self, Error> {
        Self::with_hal(config, Arc::new(CaptureConsole::new()), Arc::new(CountingTlb::new()))
    }

    /// Boots a kernel: creates the kernel process and parks the server thread on `ANY`.
    pub fn with_hal(
        config: KernelConfig,
        console: Arc<dyn Console>,
        tlb: Arc<dyn Tlb>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let mut kernel = Self {
            config,
            mem: PhysMemory::new(config.phys_base, config.frames),
            processes: IdTable::with_capacity(config.max_processes),
            threads: IdTable::with_capacity(config.max_threads),
            sched: Scheduler::new(config.ready_queue_capacity),
            kernel_work: VecDeque::new(),
            grants: BTreeMap::new(),
            server: ServerTable::new(),
            console,
            tlb,
            kernel_pid: Pid::from_raw(0),
            server_tid: Tid::from_raw(0),
            halted: None,
            _not_send_sync: PhantomData,
        };
        crate::server::install_handlers(&mut kernel.server);

        // One kernel-side channel per user process plus headroom for pager links.
        let kernel_channels = config.max_processes + config.max_channels;
        kernel.kernel_pid = kernel.create_process_inner("kernel", kernel_channels, false)?;
        let tid = kernel.thread_create(kernel.kernel_pid, 0, 0, 0, 0)?;
        if let Some(thread) = kernel.threads.get_mut(tid.as_raw()) {
            thread.task = Some(KernelTask::Server);
            thread.state = ThreadState::Ready;
        }
        kernel.server_tid = tid;
        kernel.ipc_from(tid, Cid::ANY, IpcFlags::RECV | IpcFlags::KERNEL)?;
        log::info!(
            target: "kernel",
            "boot: frames={} kernel pid={} server tid={}",
            config.frames,
            kernel.kernel_pid.as_raw(),
            tid.as_raw()
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn kernel_pid(&self) -> Pid {
        self.kernel_pid
    }

    pub fn server_tid(&self) -> Tid {
        self.server_tid
    }

    pub fn halted(&self) -> Option<HaltReason> {
        self.halted
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(pid.as_raw())
    }

    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(tid.as_raw())
    }

    pub fn channel(&self, channel: ChannelRef) -> Option<&Channel> {
        self.process(channel.pid)?.channel(channel.cid)
    }

    /// Live process ids in ascending order.
    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.processes.iter().map(|(id, _)| Pid::from_raw(id))
    }

    /// Buffer a user thread fills before sending.
    pub fn message_mut(&mut self, tid: Tid) -> Option<&mut Message> {
        let thread = self.threads.get_mut(tid.as_raw())?;
        if thread.task == Some(KernelTask::Server) {
            return None;
        }
        Some(&mut thread.buffer)
    }

    pub fn phys(&self) -> &PhysMemory {
        &self.mem
    }

    /// Writes into a frame granted to `pid`, the way a pager prepares page contents.
    pub fn write_granted(&mut self, pid: Pid, paddr: PhysAddr, offset: usize, data: &[u8]) -> Result<(), Error> {
        if self.grants.get(&paddr) != Some(&pid) {
            return Err(Error::NotPermitted);
        }
        let end = offset.checked_add(data.len()).ok_or(Error::InvalidArgs)?;
        if end > crate::mm::PAGE_SIZE {
            return Err(Error::InvalidArgs);
        }
        self.mem.write(paddr + offset, data)?;
        Ok(())
    }

    /// Frames currently granted to `pid`.
    pub fn granted_frames(&self, pid: Pid) -> impl Iterator<Item = PhysAddr> + '_ {
        self.grants.iter().filter(move |(_, owner)| **owner == pid).map(|(pa, _)| *pa)
    }

    pub fn translate(&self, pid: Pid, va: VirtAddr) -> Option<PhysAddr> {
        self.process(pid)?.space.translate(&self.mem, va)
    }

    pub fn lookup(&self, pid: Pid, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.process(pid)?.space.lookup(&self.mem, va)
    }

    pub fn current(&self) -> Option<Tid> {
        self.sched.current()
    }

    /// Moves the running thread to the back of the ready queue and dispatches the next one.
    pub fn schedule(&mut self) -> Option<Tid> {
        if let Some(prev) = self.sched.current() {
            if let Some(thread) = self.threads.get_mut(prev.as_raw()) {
                if thread.state == ThreadState::Running {
                    thread.state = ThreadState::Ready;
                }
            }
        }
        let next = self.sched.yield_current()?;
        if let Some(thread) = self.threads.get_mut(next.as_raw()) {
            thread.state = ThreadState::Running;
        }
        Some(next)
    }

    pub(crate) fn ensure_live(&self) -> Result<(), Error> {
        match self.halted {
            Some(_) => Err(Error::Halted),
            None => Ok(()),
        }
    }

    /// Makes `tid` the running thread; the previous one goes back to the ready queue.
    pub(crate) fn make_current(&mut self, tid: Tid) {
        if let Some(prev) = self.sched.current().filter(|&prev| prev != tid) {
            if let Some(thread) = self.threads.get_mut(prev.as_raw()) {
                if thread.state == ThreadState::Running {
                    thread.state = ThreadState::Ready;
                    self.enqueue_or_die(prev);
                }
            }
        }
        self.sched.set_current(tid);
        if let Some(thread) = self.threads.get_mut(tid.as_raw()) {
            thread.state = ThreadState::Running;
        }
    }

    /// Suspends `tid` in `state`.
    pub(crate) fn block(&mut self, tid: Tid, state: ThreadState) {
        if let Some(thread) = self.threads.get_mut(tid.as_raw()) {
            thread.state = state;
        }
        self.sched.purge(tid);
    }

    /// Makes a blocked thread runnable again with the outcome of its call.
    pub(crate) fn wake(&mut self, tid: Tid, result: Result<(), Error>) {
        let Some(thread) = self.threads.get_mut(tid.as_raw()) else {
            return;
        };
        thread.state = ThreadState::Ready;
        thread.pending_recv = None;
        thread.result = Some(result);
        if thread.task.is_some() {
            self.kernel_work.push_back(tid);
        } else {
            self.enqueue_or_die(tid);
        }
    }

    pub(crate) fn enqueue_or_die(&mut self, tid: Tid) {
        if let EnqueueOutcome::Rejected(reason) = self.sched.enqueue(tid) {
            panic!("ready queue rejected tid {}: {:?}", tid.as_raw(), reason);
        }
    }

    /// Runs woken kernel continuations until none is left.
    pub(crate) fn run_kernel_threads(&mut self) {
        while let Some(tid) = self.kernel_work.pop_front() {
            if self.halted.is_some() {
                self.kernel_work.clear();
                return;
            }
            let Some(thread) = self.threads.get(tid.as_raw()) else {
                continue;
            };
            if !thread.state.is_runnable() {
                continue;
            }
            match thread.task {
                Some(KernelTask::Server) => self.run_server(tid),
                Some(KernelTask::Fault(_)) => self.resume_fault(tid),
                None => {}
            }
        }
    }

    /// Common exit path of the user-facing entry points: runs kernel threads, then
    /// reports where the caller ended up.
    pub(crate) fn finish_entry(
        &mut self,
        caller: Tid,
        status: Result<IpcStatus, Error>,
    ) -> Result<IpcStatus, Error> {
        self.run_kernel_threads();
        #[cfg(feature = "debug_invariants")]
        self.assert_invariants();
        status?;
        let Some(thread) = self.threads.get_mut(caller.as_raw()) else {
            return Ok(IpcStatus::Terminated);
        };
        if thread.state.is_blocked() {
            return Ok(IpcStatus::Blocked);
        }
        let result = thread.result.take();
        self.make_current(caller);
        match result {
            Some(Err(err)) => Err(err),
            _ => Ok(IpcStatus::Completed),
        }
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("processes", &self.processes.len())
            .field("threads", &self.threads.len())
            .field("mem", &self.mem)
            .field("halted", &self.halted)
            .finish()
    }
}
