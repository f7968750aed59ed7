// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Creation and teardown of processes, threads, channels and regions
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{process_create, process_destroy, thread_create, thread_resume, thread_destroy,
//!             channel_create, channel_link, channel_incref, channel_decref, region_add, region_remove}
//! DEPENDS_ON: idtable, mm::AddressSpace, ipc wake-up helpers
//! INVARIANTS: Teardown leaves no queue entry, link or grant pointing at a removed object

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::kernel::Kernel;
use crate::mm::{AddressSpace, MapError};
use crate::sched::EnqueueOutcome;
use crate::task::{channel_index, Channel, Context, Process, RecvSource, Thread, ThreadState};
use crate::types::{ChannelRef, Cid, Pid, Tid, VirtAddr};
use crate::vm::{attrs_admissible, Pager, Region};
use crate::Error;

impl Kernel {
    /// Creates a user process with an empty address space and its kernel channel at `Cid::KERNEL`.
    pub fn process_create(&mut self, name: &str) -> Result<Pid, Error> {
        self.ensure_live()?;
        let max_channels = self.config.max_channels;
        self.create_process_inner(name, max_channels, true)
    }

    pub(crate) fn create_process_inner(
        &mut self,
        name: &str,
        max_channels: usize,
        link_kernel: bool,
    ) -> Result<Pid, Error> {
        if self.processes.peek_free().is_none() {
            return Err(Error::OutOfResource);
        }
        let space = AddressSpace::new(&mut self.mem, self.tlb.clone()).map_err(|err| match err {
            // An empty frame pool is resource exhaustion at this boundary.
            MapError::OutOfMemory => Error::OutOfResource,
            other => Error::Map(other),
        })?;
        let name = String::from(name);
        let id = self
            .processes
            .insert_with(|id| Process::new(Pid::from_raw(id), name, space, max_channels))?;
        let pid = Pid::from_raw(id);

        if link_kernel {
            if let Err(err) = self.connect_kernel_channel(pid) {
                self.teardown_process(pid);
                return Err(err);
            }
        }
        log::info!(target: "task", "process {} '{}' created", pid.as_raw(), self.process_name(pid));
        Ok(pid)
    }

    fn connect_kernel_channel(&mut self, pid: Pid) -> Result<(), Error> {
        let user = self.channel_create(pid)?;
        debug_assert_eq!(user, Cid::KERNEL);
        let kernel = self.channel_create(self.kernel_pid)?;
        self.channel_link(ChannelRef::new(pid, user), ChannelRef::new(self.kernel_pid, kernel))
    }

    fn process_name(&self, pid: Pid) -> &str {
        self.process(pid).map_or("?", Process::name)
    }

    /// Destroys a process and everything it owns. Peers waiting on its channels fail with `PeerGone`.
    pub fn process_destroy(&mut self, pid: Pid) -> Result<(), Error> {
        self.ensure_live()?;
        if pid == self.kernel_pid {
            return Err(Error::NotPermitted);
        }
        if !self.processes.contains(pid.as_raw()) {
            return Err(Error::NotFound);
        }
        self.teardown_process(pid);
        self.run_kernel_threads();
        Ok(())
    }

    pub(crate) fn teardown_process(&mut self, pid: Pid) {
        let Some(process) = self.processes.remove(pid.as_raw()) else {
            return;
        };
        let Process { space, channels, threads, .. } = process;

        for tid in threads {
            if let Some(thread) = self.threads.remove(tid.as_raw()) {
                self.unlink_waiter(&thread);
            }
            self.sched.purge(tid);
            self.kernel_work.retain(|&queued| queued != tid);
        }

        for (id, channel) in channels.iter() {
            let cid = Cid::from_raw(id as i32);
            self.revoke_channel(ChannelRef::new(pid, cid), channel);
        }

        let granted: Vec<_> =
            self.grants.iter().filter(|(_, owner)| **owner == pid).map(|(pa, _)| *pa).collect();
        for pa in granted {
            self.grants.remove(&pa);
            if let Err(err) = self.mem.free(pa) {
                panic!("granted frame {pa:#x} not allocated: {err}");
            }
        }

        let released = space.destroy(&mut self.mem);
        log::info!(
            target: "task",
            "process {} destroyed, {} frames released",
            pid.as_raw(),
            released
        );
    }

    /// Wakes everyone depending on a channel that just left its owner's table
    /// and breaks its link.
    fn revoke_channel(&mut self, this: ChannelRef, channel: &Channel) {
        for &tid in &channel.senders {
            self.wake(tid, Err(Error::PeerGone));
        }
        for &tid in &channel.receivers {
            self.wake(tid, Err(Error::PeerGone));
        }
        let Some(peer) = channel.linked_to else {
            return;
        };
        let peer_is_kernel = peer.pid == self.kernel_pid && this.pid != self.kernel_pid;
        let Some(peer_channel) = self.processes.get_mut(peer.pid.as_raw()).and_then(|p| p.channel_mut(peer.cid))
        else {
            return;
        };
        if peer_channel.linked_to != Some(this) {
            return;
        }
        peer_channel.linked_to = None;
        let waiters: Vec<Tid> =
            peer_channel.receivers.drain(..).chain(peer_channel.senders.drain(..)).collect();
        for tid in waiters {
            self.wake(tid, Err(Error::PeerGone));
        }
        if peer_is_kernel {
            // Kernel-side ends exist only for their user peer.
            self.remove_channel(peer);
        }
        log::debug!(target: "task", "channel {} revoked, peer {} unlinked", this, peer);
    }

    fn remove_channel(&mut self, target: ChannelRef) {
        let Some(channel) = self
            .processes
            .get_mut(target.pid.as_raw())
            .and_then(|p| channel_index(target.cid).and_then(|id| p.channels.remove(id)))
        else {
            return;
        };
        self.revoke_channel(target, &channel);
    }

    /// Removes a terminated thread from whatever wait queue holds it.
    fn unlink_waiter(&mut self, thread: &Thread) {
        let tid = thread.tid();
        match thread.state {
            ThreadState::BlockedSend(target) => {
                if let Some(channel) =
                    self.processes.get_mut(target.pid.as_raw()).and_then(|p| p.channel_mut(target.cid))
                {
                    channel.senders.retain(|&queued| queued != tid);
                }
            }
            ThreadState::BlockedRecv(source) => {
                let Some(process) = self.processes.get_mut(thread.pid().as_raw()) else {
                    return;
                };
                match source {
                    RecvSource::Any => process.any_receivers.retain(|&queued| queued != tid),
                    RecvSource::Channel(cid) => {
                        if let Some(channel) = process.channel_mut(cid) {
                            channel.receivers.retain(|&queued| queued != tid);
                        }
                    }
                }
            }
            ThreadState::Created | ThreadState::Ready | ThreadState::Running => {}
        }
    }

    /// Creates a thread in `Created` state.
    pub fn thread_create(
        &mut self,
        pid: Pid,
        entry: VirtAddr,
        stack: VirtAddr,
        buffer: VirtAddr,
        arg: usize,
    ) -> Result<Tid, Error> {
        self.ensure_live()?;
        if !self.processes.contains(pid.as_raw()) {
            return Err(Error::NotFound);
        }
        let context = Context { entry, stack, buffer, arg, pc: entry };
        let id = self.threads.insert_with(|id| Thread::new(Tid::from_raw(id), pid, context))?;
        let tid = Tid::from_raw(id);
        if let Some(process) = self.processes.get_mut(pid.as_raw()) {
            process.threads.push(tid);
        }
        log::debug!(target: "task", "thread {} created in process {} entry={:#x}", id, pid.as_raw(), entry);
        Ok(tid)
    }

    /// Moves a freshly created thread to the ready queue.
    pub fn thread_resume(&mut self, tid: Tid) -> Result<(), Error> {
        self.ensure_live()?;
        let thread = self.threads.get_mut(tid.as_raw()).ok_or(Error::NotFound)?;
        if thread.state != ThreadState::Created {
            return Err(Error::InvalidArgs);
        }
        match self.sched.enqueue(tid) {
            EnqueueOutcome::Enqueued | EnqueueOutcome::AlreadyQueued => {}
            EnqueueOutcome::Rejected(reason) => {
                log::warn!(target: "task", "resume of thread {} rejected: {:?}", tid.as_raw(), reason);
                return Err(Error::OutOfResource);
            }
        }
        thread.state = ThreadState::Ready;
        Ok(())
    }

    /// Terminates a single user thread.
    pub fn thread_destroy(&mut self, tid: Tid) -> Result<(), Error> {
        self.ensure_live()?;
        let thread = self.threads.get(tid.as_raw()).ok_or(Error::NotFound)?;
        if thread.pid() == self.kernel_pid {
            return Err(Error::NotPermitted);
        }
        let pid = thread.pid();
        if let Some(thread) = self.threads.remove(tid.as_raw()) {
            self.unlink_waiter(&thread);
        }
        if let Some(process) = self.processes.get_mut(pid.as_raw()) {
            process.threads.retain(|&t| t != tid);
        }
        self.sched.purge(tid);
        self.kernel_work.retain(|&queued| queued != tid);
        log::debug!(target: "task", "thread {} destroyed", tid.as_raw());
        Ok(())
    }

    /// Creates an unlinked channel with refcount 1.
    pub fn channel_create(&mut self, pid: Pid) -> Result<Cid, Error> {
        self.ensure_live()?;
        let process = self.processes.get_mut(pid.as_raw()).ok_or(Error::NotFound)?;
        let id = process.channels.insert(Channel::new())?;
        Ok(Cid::from_raw(id as i32))
    }

    /// Links two channels to each other.
    pub fn channel_link(&mut self, a: ChannelRef, b: ChannelRef) -> Result<(), Error> {
        self.ensure_live()?;
        if a == b {
            return Err(Error::InvalidArgs);
        }
        let linked_a = self.channel(a).ok_or(Error::NotFound)?.linked_to;
        let linked_b = self.channel(b).ok_or(Error::NotFound)?.linked_to;
        if linked_a.is_some() || linked_b.is_some() {
            return Err(Error::AlreadyLinked);
        }
        if let Some(channel) = self.channel_mut(a) {
            channel.linked_to = Some(b);
        }
        if let Some(channel) = self.channel_mut(b) {
            channel.linked_to = Some(a);
        }
        log::debug!(target: "task", "linked {} <-> {}", a, b);
        Ok(())
    }

    /// Adds a reference; returns the new count.
    pub fn channel_incref(&mut self, target: ChannelRef) -> Result<usize, Error> {
        self.ensure_live()?;
        let channel = self.channel_mut(target).ok_or(Error::NotFound)?;
        channel.refcount += 1;
        Ok(channel.refcount)
    }

    /// Drops a reference; the last one destroys the channel. Returns the remaining count.
    pub fn channel_decref(&mut self, target: ChannelRef) -> Result<usize, Error> {
        self.ensure_live()?;
        let remaining = self.decref_channel(target);
        self.run_kernel_threads();
        remaining
    }

    pub(crate) fn decref_channel(&mut self, target: ChannelRef) -> Result<usize, Error> {
        let channel = self.channel_mut(target).ok_or(Error::NotFound)?;
        channel.refcount -= 1;
        let remaining = channel.refcount;
        if remaining == 0 {
            let Some(channel) = self
                .processes
                .get_mut(target.pid.as_raw())
                .and_then(|p| channel_index(target.cid).and_then(|id| p.channels.remove(id)))
            else {
                return Ok(0);
            };
            self.revoke_channel(target, &channel);
            log::debug!(target: "task", "channel {} destroyed", target);
        }
        Ok(remaining)
    }

    pub(crate) fn channel_mut(&mut self, target: ChannelRef) -> Option<&mut Channel> {
        self.processes.get_mut(target.pid.as_raw())?.channel_mut(target.cid)
    }

    /// Registers a region in `pid`'s address space. A channel-backed region holds a reference on its channel.
    /// Attribute sets no page could be mapped with are refused with `InvalidArgs`.
    pub fn region_add(&mut self, pid: Pid, region: Region) -> Result<(), Error> {
        self.ensure_live()?;
        if !attrs_admissible(region.attrs) {
            return Err(Error::InvalidArgs);
        }
        let process = self.processes.get_mut(pid.as_raw()).ok_or(Error::NotFound)?;
        let pager = match &region.pager {
            Pager::Channel(cid) => {
                if process.channel(*cid).is_none() {
                    return Err(Error::NotFound);
                }
                Some(*cid)
            }
            Pager::File(_) => None,
        };
        let (start, end) = (region.start, region.end);
        process.regions.add(region)?;
        if let Some(cid) = pager {
            if let Some(channel) = process.channel_mut(cid) {
                channel.refcount += 1;
            }
        }
        log::debug!(target: "vm", "process {} region [{:#x}, {:#x})", pid.as_raw(), start, end);
        Ok(())
    }

    /// Removes the region starting at `start`, unmapping its pages. Returns the number of pages unmapped.
    pub fn region_remove(&mut self, pid: Pid, start: VirtAddr) -> Result<usize, Error> {
        self.ensure_live()?;
        let process = self.processes.get_mut(pid.as_raw()).ok_or(Error::NotFound)?;
        let region = process.regions.remove(start)?;
        let unmapped = process.space.unmap(&mut self.mem, region.start, region.len())?;
        if let Pager::Channel(cid) = region.pager {
            self.decref_channel(ChannelRef::new(pid, cid))?;
            self.run_kernel_threads();
        }
        Ok(unmapped)
    }
}
