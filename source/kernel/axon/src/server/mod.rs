// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel server loop and its label dispatch table
//! OWNERS: @kernel-team
//! PUBLIC API: ServerTable, Handler, Request, Disposition
//! DEPENDS_ON: ipc (kernel-originated send/recv), server::api (handlers), axon-abi proto
//! INVARIANTS: Labels are validated before payloads; the server never blocks on a client

pub mod api;

use axon_abi::proto::{KernelReply, KernelRequest};
use axon_abi::IpcFlags;

pub use api::install_handlers;

use crate::ipc::IpcStatus;
use crate::kernel::Kernel;
use crate::types::{Cid, Pid, Tid};
use crate::Error;

/// Highest label the table can hold, plus one.
const MAX_LABEL: usize = 16;

/// A decoded request together with its envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Process that sent the request.
    pub sender: Pid,
    /// Kernel-side channel it arrived on.
    pub from: Cid,
    pub body: KernelRequest,
}

/// What the server sends back once a handler returns `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Reply(KernelReply),
    /// The requester is gone or the kernel halted.
    NoReply,
}

/// Type alias for a server handler.
pub type Handler = fn(&mut Kernel, &Request) -> Result<Disposition, Error>;

/// Dispatch table storing handlers by request label.
pub struct ServerTable {
    handlers: [Option<Handler>; MAX_LABEL],
}

impl ServerTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_LABEL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, label: i32, handler: Handler) {
        if let Some(slot) = usize::try_from(label).ok().and_then(|index| self.handlers.get_mut(index)) {
            *slot = Some(handler);
        }
    }

    /// Returns the handler registered for `label`.
    pub fn handler(&self, label: i32) -> Option<Handler> {
        usize::try_from(label).ok().and_then(|index| self.handlers.get(index)).and_then(|entry| *entry)
    }
}

impl Default for ServerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes the handler registered for the request's label.
pub fn dispatch(kernel: &mut Kernel, request: &Request) -> Result<Disposition, Error> {
    let handler = kernel.server.handler(request.body.label()).ok_or(Error::InvalidMessage)?;
    handler(kernel, request)
}

impl Kernel {
    /// Body of the kernel server thread: handle the delivered message, reply, receive again.
    pub(crate) fn run_server(&mut self, tid: Tid) {
        loop {
            let Some(thread) = self.threads.get_mut(tid.as_raw()) else {
                return;
            };
            thread.result = None;
            let header = thread.buffer.header;
            let outcome = match KernelRequest::decode(&thread.buffer) {
                Ok(body) => dispatch(self, &Request { sender: header.src, from: header.from, body }),
                Err(err) => Err(Error::from(err)),
            };
            if self.halted.is_some() {
                return;
            }
            match outcome {
                Ok(Disposition::Reply(reply)) => self.server_reply(tid, header.from, |msg| reply.encode(msg)),
                Ok(Disposition::NoReply) => {}
                Err(err) => {
                    log::debug!(
                        target: "server",
                        "request label={} from pid {} failed: {}",
                        header.label,
                        header.src.as_raw(),
                        err
                    );
                    self.server_reply(tid, header.from, |msg| msg.set_error(err.code()));
                }
            }
            match self.ipc_from(tid, Cid::ANY, IpcFlags::RECV | IpcFlags::KERNEL) {
                Ok(IpcStatus::Completed) => continue,
                Ok(_) => return,
                Err(err) => panic!("kernel server cannot receive: {err}"),
            }
        }
    }

    fn server_reply(&mut self, tid: Tid, to: Cid, write: impl FnOnce(&mut axon_abi::Message)) {
        let Some(thread) = self.threads.get_mut(tid.as_raw()) else {
            return;
        };
        write(thread.buffer.as_mut());
        if let Err(err) = self.ipc_from(tid, to, IpcFlags::SEND | IpcFlags::NOBLOCK | IpcFlags::KERNEL) {
            // Clients that are not waiting lose their reply.
            log::debug!(target: "server", "reply on cid {} dropped: {}", to.as_raw(), err);
        }
    }
}
