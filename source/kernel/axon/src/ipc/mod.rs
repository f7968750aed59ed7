// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous rendezvous IPC between linked channels
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: Kernel::ipc, IpcStatus
//! DEPENDS_ON: task (threads, channels), sched (wake-ups), axon-abi Message
//! INVARIANTS: Exactly one copy per rendezvous; senders are served FIFO per channel;
//!             a blocked thread sits in exactly one wait queue

use axon_abi::IpcFlags;

use crate::kernel::Kernel;
use crate::task::{KernelTask, RecvSource, ThreadState};
use crate::types::{ChannelRef, Cid, Pid, Tid};
use crate::Error;


/// Where the calling thread stands when an IPC entry point returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcStatus {
    /// The call finished; the thread is running.
    Completed,
    /// The thread is suspended until a partner arrives.
    Blocked,
    /// The call destroyed the caller (e.g. `EXIT_CURRENT`).
    Terminated,
}

impl Kernel {
    /// Performs an IPC operation on behalf of user thread `caller`.
    ///
    /// For `SEND` the caller's message buffer is the outgoing message; for `RECV`
    /// the received message overwrites it.
    pub fn ipc(&mut self, caller: Tid, cid: Cid, flags: IpcFlags) -> Result<IpcStatus, Error> {
        self.ensure_live()?;
        if flags.contains(IpcFlags::KERNEL) {
            return Err(Error::InvalidArgs);
        }
        let thread = self.threads.get(caller.as_raw()).ok_or(Error::NotFound)?;
        if thread.task == Some(KernelTask::Server) {
            return Err(Error::NotPermitted);
        }
        let status = self.ipc_from(caller, cid, flags);
        self.finish_entry(caller, status)
    }

    /// IPC core shared by user calls and kernel-originated calls.
    pub(crate) fn ipc_from(&mut self, caller: Tid, cid: Cid, flags: IpcFlags) -> Result<IpcStatus, Error> {
        let thread = self.threads.get(caller.as_raw()).ok_or(Error::NotFound)?;
        if !thread.state.is_runnable() {
            return Err(Error::NotRunnable);
        }
        let pid = thread.pid();
        let send = flags.contains(IpcFlags::SEND);
        let recv = flags.contains(IpcFlags::RECV);
        if cid == Cid::DENY || !(send || recv) || (send && cid == Cid::ANY) {
            return Err(Error::InvalidArgs);
        }
        if !flags.contains(IpcFlags::KERNEL) {
            self.make_current(caller);
        }
        if let Some(thread) = self.threads.get_mut(caller.as_raw()) {
            thread.result = None;
        }

        if send && !self.send_phase(caller, pid, cid, flags)? {
            return Ok(IpcStatus::Blocked);
        }
        if recv {
            return self.recv_phase(caller, pid, cid, flags);
        }
        Ok(IpcStatus::Completed)
    }

    /// Returns `false` when the sender was queued.
    fn send_phase(&mut self, caller: Tid, pid: Pid, cid: Cid, flags: IpcFlags) -> Result<bool, Error> {
        let peer = self.peer_of(pid, cid)?;
        if let Some(receiver) = self.take_receiver(peer) {
            self.deliver(caller, receiver, peer.cid)?;
            self.wake(receiver, Ok(()));
            log::trace!(
                target: "ipc",
                "tid {} -> tid {} via {}",
                caller.as_raw(),
                receiver.as_raw(),
                peer
            );
            return Ok(true);
        }
        if flags.contains(IpcFlags::NOBLOCK) {
            return Err(Error::WouldBlock);
        }
        if let Some(channel) = self.channel_mut(peer) {
            channel.senders.push_back(caller);
        }
        if let Some(thread) = self.threads.get_mut(caller.as_raw()) {
            thread.pending_recv = flags.contains(IpcFlags::RECV).then_some(RecvSource::Channel(cid));
        }
        self.block(caller, ThreadState::BlockedSend(peer));
        log::trace!(target: "ipc", "tid {} queued on {}", caller.as_raw(), peer);
        Ok(false)
    }

    fn recv_phase(&mut self, caller: Tid, pid: Pid, cid: Cid, flags: IpcFlags) -> Result<IpcStatus, Error> {
        let source = if cid == Cid::ANY {
            RecvSource::Any
        } else {
            if self.channel(ChannelRef::new(pid, cid)).is_none() {
                return Err(Error::NotFound);
            }
            RecvSource::Channel(cid)
        };
        if let Some((sender, arrival)) = self.take_sender(pid, source) {
            self.deliver(sender, caller, arrival)?;
            self.release_sender(sender);
            return Ok(IpcStatus::Completed);
        }
        if flags.contains(IpcFlags::NOBLOCK) {
            return Err(Error::WouldBlock);
        }
        self.block_recv(caller, pid, source);
        Ok(IpcStatus::Blocked)
    }

    /// Channel linked to `(pid, cid)`.
    fn peer_of(&self, pid: Pid, cid: Cid) -> Result<ChannelRef, Error> {
        let channel = self.channel(ChannelRef::new(pid, cid)).ok_or(Error::NotFound)?;
        let peer = channel.linked_to.ok_or(Error::PeerGone)?;
        if self.channel(peer).is_none() {
            return Err(Error::PeerGone);
        }
        Ok(peer)
    }

    /// Oldest receiver waiting on `peer`, falling back to the peer process' `ANY` receivers.
    fn take_receiver(&mut self, peer: ChannelRef) -> Option<Tid> {
        let process = self.processes.get_mut(peer.pid.as_raw())?;
        if let Some(tid) = process.channel_mut(peer.cid).and_then(|ch| ch.receivers.pop_front()) {
            return Some(tid);
        }
        process.any_receivers.pop_front()
    }

    /// Oldest queued sender for `source` and the channel it arrives on. `ANY` scans channels in id order.
    fn take_sender(&mut self, pid: Pid, source: RecvSource) -> Option<(Tid, Cid)> {
        let process = self.processes.get_mut(pid.as_raw())?;
        match source {
            RecvSource::Channel(cid) => {
                process.channel_mut(cid)?.senders.pop_front().map(|tid| (tid, cid))
            }
            RecvSource::Any => process
                .channels
                .iter_mut()
                .find_map(|(id, ch)| ch.senders.pop_front().map(|tid| (tid, Cid::from_raw(id as i32)))),
        }
    }

    /// Copies the sender's buffer into the receiver's and stamps the envelope.
    fn deliver(&mut self, from: Tid, to: Tid, arrival: Cid) -> Result<(), Error> {
        let (sender, receiver) = self.threads.pair_mut(from.as_raw(), to.as_raw()).ok_or(Error::NotFound)?;
        receiver.buffer.copy_from(&sender.buffer);
        receiver.buffer.header.src = sender.pid();
        receiver.buffer.header.from = arrival;
        Ok(())
    }

    /// A queued sender whose message was taken: plain sends complete, calls move on to receive.
    fn release_sender(&mut self, sender: Tid) {
        let pending = self.threads.get_mut(sender.as_raw()).and_then(|t| t.pending_recv.take());
        let Some(source) = pending else {
            self.wake(sender, Ok(()));
            return;
        };
        let Some(pid) = self.threads.get(sender.as_raw()).map(|t| t.pid()) else {
            return;
        };
        if let Some((partner, arrival)) = self.take_sender(pid, source) {
            if self.deliver(partner, sender, arrival).is_ok() {
                self.release_sender(partner);
                self.wake(sender, Ok(()));
                return;
            }
        }
        self.block_recv(sender, pid, source);
    }

    fn block_recv(&mut self, tid: Tid, pid: Pid, source: RecvSource) {
        let Some(process) = self.processes.get_mut(pid.as_raw()) else {
            return;
        };
        match source {
            RecvSource::Any => process.any_receivers.push_back(tid),
            RecvSource::Channel(cid) => match process.channel_mut(cid) {
                Some(channel) => channel.receivers.push_back(tid),
                None => {
                    // The channel went away while the send half was queued.
                    self.wake(tid, Err(Error::PeerGone));
                    return;
                }
            },
        }
        self.block(tid, ThreadState::BlockedRecv(source));
    }
}
