// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process, thread and channel objects owned by the kernel registry
//! OWNERS: @kernel-team
//! PUBLIC API: Process, Thread, Channel, ThreadState, RecvSource, Context
//! DEPENDS_ON: idtable, mm::AddressSpace, vm::RegionList, axon-abi Message
//! INVARIANTS: A process owns its threads, channels and address space; links are stored by id, never by pointer

extern crate alloc;

use alloc::{boxed::Box, collections::VecDeque, string::String, vec::Vec};

use axon_abi::Message;

use crate::idtable::IdTable;
use crate::mm::{AddressSpace, PageFlags};
use crate::types::{ChannelRef, Cid, Pid, Tid, VirtAddr};
use crate::vm::RegionList;
use crate::Error;

mod lifecycle;


/// Scheduling state of a thread. Termination removes the thread from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created but never resumed.
    Created,
    Ready,
    Running,
    /// Queued on the given channel until a receiver takes the message.
    BlockedSend(ChannelRef),
    BlockedRecv(RecvSource),
}

impl ThreadState {
    pub fn is_blocked(self) -> bool {
        matches!(self, ThreadState::BlockedSend(_) | ThreadState::BlockedRecv(_))
    }

    pub fn is_runnable(self) -> bool {
        matches!(self, ThreadState::Ready | ThreadState::Running)
    }
}

/// What a blocked receiver is waiting on, in its own process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvSource {
    Channel(Cid),
    Any,
}

/// Saved user context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub entry: VirtAddr,
    pub stack: VirtAddr,
    /// User address of the IPC buffer.
    pub buffer: VirtAddr,
    pub arg: usize,
    /// Address execution resumes at.
    pub pc: VirtAddr,
}

/// Work the kernel performs on a thread's behalf when it is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KernelTask {
    /// The kernel server loop.
    Server,
    /// Install the page supplied by a pager.
    Fault(PendingFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingFault {
    pub page: VirtAddr,
    pub offset: usize,
    pub flags: PageFlags,
}

pub struct Thread {
    tid: Tid,
    pid: Pid,
    pub(crate) state: ThreadState,
    pub(crate) context: Context,
    pub(crate) buffer: Box<Message>,
    /// Receive phase of a CALL whose send is still queued.
    pub(crate) pending_recv: Option<RecvSource>,
    /// Outcome of the last blocking call, set on wake-up.
    pub(crate) result: Option<Result<(), Error>>,
    pub(crate) task: Option<KernelTask>,
}

impl Thread {
    pub(crate) fn new(tid: Tid, pid: Pid, context: Context) -> Self {
        Self {
            tid,
            pid,
            state: ThreadState::Created,
            context,
            buffer: Box::new(Message::new()),
            pending_recv: None,
            result: None,
            task: None,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The inline message buffer.
    pub fn message(&self) -> &Message {
        &self.buffer
    }

    /// Result stored by the last wake-up, if not yet consumed.
    pub fn last_result(&self) -> Option<Result<(), Error>> {
        self.result
    }

    pub fn is_kernel_thread(&self) -> bool {
        matches!(self.task, Some(KernelTask::Server))
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid.as_raw())
            .field("pid", &self.pid.as_raw())
            .field("state", &self.state)
            .finish()
    }
}

/// Process-scoped IPC endpoint.
#[derive(Debug)]
pub struct Channel {
    pub(crate) refcount: usize,
    pub(crate) linked_to: Option<ChannelRef>,
    /// Threads of the peer process blocked sending to this channel, oldest first.
    pub(crate) senders: VecDeque<Tid>,
    /// Threads of the owner blocked receiving on this channel.
    pub(crate) receivers: VecDeque<Tid>,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Self { refcount: 1, linked_to: None, senders: VecDeque::new(), receivers: VecDeque::new() }
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn linked_to(&self) -> Option<ChannelRef> {
        self.linked_to
    }

    pub fn queued_senders(&self) -> usize {
        self.senders.len()
    }
}

pub struct Process {
    pid: Pid,
    name: String,
    pub(crate) space: AddressSpace,
    pub(crate) regions: RegionList,
    pub(crate) channels: IdTable<Channel>,
    pub(crate) threads: Vec<Tid>,
    /// Threads blocked receiving on `Cid::ANY`.
    pub(crate) any_receivers: VecDeque<Tid>,
}

impl Process {
    pub(crate) fn new(pid: Pid, name: String, space: AddressSpace, max_channels: usize) -> Self {
        Self {
            pid,
            name,
            space,
            regions: RegionList::new(),
            channels: IdTable::with_capacity(max_channels),
            threads: Vec::new(),
            any_receivers: VecDeque::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> &[Tid] {
        &self.threads
    }

    pub fn channel(&self, cid: Cid) -> Option<&Channel> {
        channel_index(cid).and_then(|id| self.channels.get(id))
    }

    pub(crate) fn channel_mut(&mut self, cid: Cid) -> Option<&mut Channel> {
        let id = channel_index(cid)?;
        self.channels.get_mut(id)
    }

    pub fn channel_ids(&self) -> Vec<Cid> {
        self.channels.iter().map(|(id, _)| Cid::from_raw(id as i32)).collect()
    }

    pub fn regions(&self) -> &RegionList {
        &self.regions
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid.as_raw())
            .field("name", &self.name)
            .field("threads", &self.threads.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// Channel ids are positive; `ANY` and `DENY` never name a channel.
pub(crate) fn channel_index(cid: Cid) -> Option<u32> {
    u32::try_from(cid.as_raw()).ok().filter(|&id| id != 0)
}
