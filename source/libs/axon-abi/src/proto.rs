// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed payloads of the kernel server and pager protocols.
//!
//! Every decoder checks the label first, then the exact payload length, then
//! field domains. Layouts are little endian and fixed size.

use crate::{label, Cid, ErrorCode, Message, PageAttrs, Pid, Tid};

/// Reasons a payload failed to decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Label does not belong to this protocol.
    UnknownLabel(i32),
    /// Payload length differs from the layout of `label`.
    BadLength {
        /// Label being decoded.
        label: i32,
        /// Length found in the header.
        len: usize,
    },
    /// A field holds a value outside its domain.
    BadField,
}

impl From<DecodeError> for ErrorCode {
    fn from(_: DecodeError) -> Self {
        ErrorCode::InvalidMessage
    }
}

const MAX_FIELDS_LEN: usize = 40;

struct Writer {
    buf: [u8; MAX_FIELDS_LEN],
    len: usize,
}

impl Writer {
    fn new() -> Self {
        Self { buf: [0; MAX_FIELDS_LEN], len: 0 }
    }

    fn put(mut self, bytes: &[u8]) -> Self {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self
    }

    fn finish(self, msg: &mut Message, label: i32) {
        // Layouts are far below MAX_PAYLOAD, so `set` cannot fail.
        let _ = msg.set(label, &self.buf[..self.len]);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[..N]);
        self.buf = &self.buf[N..];
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }
}

fn expect_len(msg: &Message, expected: usize) -> Result<Reader<'_>, DecodeError> {
    let payload = msg.payload();
    if payload.len() != expected {
        return Err(DecodeError::BadLength { label: msg.label(), len: payload.len() });
    }
    Ok(Reader { buf: payload })
}

fn expect_label(msg: &Message, label: i32) -> Result<(), DecodeError> {
    if msg.label() != label {
        return Err(DecodeError::UnknownLabel(msg.label()));
    }
    Ok(())
}

/// Requests handled by the kernel server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelRequest {
    /// Print one byte on the kernel console.
    PrintChar {
        /// Byte to print.
        ch: u8,
    },
    /// Terminate the calling process.
    ExitCurrent {
        /// Exit status, logged only.
        code: i32,
    },
    /// Create a process linked to the caller.
    CreateProcess,
    /// Create and start a thread in `pid`.
    SpawnThread {
        /// Target process.
        pid: Pid,
        /// Entry point.
        entry: u64,
        /// Initial stack pointer.
        stack: u64,
        /// User address of the IPC buffer.
        buffer: u64,
        /// First argument.
        arg: u64,
    },
    /// Register a channel-backed region in `pid`.
    AddPager {
        /// Target process.
        pid: Pid,
        /// Pager channel, as numbered in the target process.
        pager: Cid,
        /// First byte of the region.
        start: u64,
        /// Region length in bytes.
        size: u64,
        /// Access attributes.
        attrs: PageAttrs,
    },
    /// Halt the kernel.
    ExitKernelTest,
    /// Obtain a zeroed frame for use as a page.
    AllocPage,
}

impl KernelRequest {
    /// Label carried by this request.
    pub const fn label(&self) -> i32 {
        match self {
            KernelRequest::PrintChar { .. } => label::PRINTCHAR,
            KernelRequest::ExitCurrent { .. } => label::EXIT_CURRENT,
            KernelRequest::CreateProcess => label::CREATE_PROCESS,
            KernelRequest::SpawnThread { .. } => label::SPAWN_THREAD,
            KernelRequest::AddPager { .. } => label::ADD_PAGER,
            KernelRequest::ExitKernelTest => label::EXIT_KERNEL_TEST,
            KernelRequest::AllocPage => label::ALLOC_PAGE,
        }
    }

    /// Writes the request into `msg`.
    pub fn encode(&self, msg: &mut Message) {
        let w = Writer::new();
        let w = match *self {
            KernelRequest::PrintChar { ch } => w.put(&[ch]),
            KernelRequest::ExitCurrent { code } => w.put(&code.to_le_bytes()),
            KernelRequest::CreateProcess
            | KernelRequest::ExitKernelTest
            | KernelRequest::AllocPage => w,
            KernelRequest::SpawnThread { pid, entry, stack, buffer, arg } => w
                .put(&pid.as_raw().to_le_bytes())
                .put(&entry.to_le_bytes())
                .put(&stack.to_le_bytes())
                .put(&buffer.to_le_bytes())
                .put(&arg.to_le_bytes()),
            KernelRequest::AddPager { pid, pager, start, size, attrs } => w
                .put(&pid.as_raw().to_le_bytes())
                .put(&pager.as_raw().to_le_bytes())
                .put(&start.to_le_bytes())
                .put(&size.to_le_bytes())
                .put(&[attrs.bits()]),
        };
        w.finish(msg, self.label());
    }

    /// Decodes a request; unknown labels are rejected before the payload is read.
    pub fn decode(msg: &Message) -> Result<Self, DecodeError> {
        match msg.label() {
            label::PRINTCHAR => {
                let mut r = expect_len(msg, 1)?;
                Ok(KernelRequest::PrintChar { ch: r.u8() })
            }
            label::EXIT_CURRENT => {
                let mut r = expect_len(msg, 4)?;
                Ok(KernelRequest::ExitCurrent { code: r.i32() })
            }
            label::CREATE_PROCESS => {
                expect_len(msg, 0)?;
                Ok(KernelRequest::CreateProcess)
            }
            label::SPAWN_THREAD => {
                let mut r = expect_len(msg, 36)?;
                Ok(KernelRequest::SpawnThread {
                    pid: Pid::from_raw(r.u32()),
                    entry: r.u64(),
                    stack: r.u64(),
                    buffer: r.u64(),
                    arg: r.u64(),
                })
            }
            label::ADD_PAGER => {
                let mut r = expect_len(msg, 25)?;
                let pid = Pid::from_raw(r.u32());
                let pager = Cid::from_raw(r.i32());
                let start = r.u64();
                let size = r.u64();
                let attrs = PageAttrs::from_bits(r.u8()).ok_or(DecodeError::BadField)?;
                Ok(KernelRequest::AddPager { pid, pager, start, size, attrs })
            }
            label::EXIT_KERNEL_TEST => {
                expect_len(msg, 0)?;
                Ok(KernelRequest::ExitKernelTest)
            }
            label::ALLOC_PAGE => {
                expect_len(msg, 0)?;
                Ok(KernelRequest::AllocPage)
            }
            other => Err(DecodeError::UnknownLabel(other)),
        }
    }
}

/// Successful replies of the kernel server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelReply {
    /// Character printed.
    PrintChar,
    /// Process created.
    CreateProcess {
        /// New process.
        pid: Pid,
        /// Requester's end of the link.
        pager_ch: Cid,
        /// New process's end of the link.
        child_ch: Cid,
    },
    /// Thread started.
    SpawnThread {
        /// New thread.
        tid: Tid,
    },
    /// Region registered.
    AddPager,
    /// Frame granted to the caller.
    AllocPage {
        /// Physical address of the frame.
        paddr: u64,
    },
}

impl KernelReply {
    /// Label carried by this reply.
    pub const fn label(&self) -> i32 {
        match self {
            KernelReply::PrintChar => label::PRINTCHAR_REPLY,
            KernelReply::CreateProcess { .. } => label::CREATE_PROCESS_REPLY,
            KernelReply::SpawnThread { .. } => label::SPAWN_THREAD_REPLY,
            KernelReply::AddPager => label::ADD_PAGER_REPLY,
            KernelReply::AllocPage { .. } => label::ALLOC_PAGE_REPLY,
        }
    }

    /// Writes the reply into `msg`.
    pub fn encode(&self, msg: &mut Message) {
        let w = Writer::new();
        let w = match *self {
            KernelReply::PrintChar | KernelReply::AddPager => w,
            KernelReply::CreateProcess { pid, pager_ch, child_ch } => w
                .put(&pid.as_raw().to_le_bytes())
                .put(&pager_ch.as_raw().to_le_bytes())
                .put(&child_ch.as_raw().to_le_bytes()),
            KernelReply::SpawnThread { tid } => w.put(&tid.as_raw().to_le_bytes()),
            KernelReply::AllocPage { paddr } => w.put(&paddr.to_le_bytes()),
        };
        w.finish(msg, self.label());
    }

    /// Decodes a reply. Error replies surface as `Err(ErrorCode)` through
    /// [`Message::status`] before this is called.
    pub fn decode(msg: &Message) -> Result<Self, DecodeError> {
        match msg.label() {
            label::PRINTCHAR_REPLY => {
                expect_len(msg, 0)?;
                Ok(KernelReply::PrintChar)
            }
            label::CREATE_PROCESS_REPLY => {
                let mut r = expect_len(msg, 12)?;
                Ok(KernelReply::CreateProcess {
                    pid: Pid::from_raw(r.u32()),
                    pager_ch: Cid::from_raw(r.i32()),
                    child_ch: Cid::from_raw(r.i32()),
                })
            }
            label::SPAWN_THREAD_REPLY => {
                let mut r = expect_len(msg, 4)?;
                Ok(KernelReply::SpawnThread { tid: Tid::from_raw(r.u32()) })
            }
            label::ADD_PAGER_REPLY => {
                expect_len(msg, 0)?;
                Ok(KernelReply::AddPager)
            }
            label::ALLOC_PAGE_REPLY => {
                let mut r = expect_len(msg, 8)?;
                Ok(KernelReply::AllocPage { paddr: r.u64() })
            }
            other => Err(DecodeError::UnknownLabel(other)),
        }
    }
}

/// Kernel to pager: supply the page containing `addr` of process `pid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillPageRequest {
    /// Faulting process.
    pub pid: Pid,
    /// Page-aligned faulting address.
    pub addr: u64,
}

impl FillPageRequest {
    /// Writes the request into `msg`.
    pub fn encode(&self, msg: &mut Message) {
        Writer::new()
            .put(&self.pid.as_raw().to_le_bytes())
            .put(&self.addr.to_le_bytes())
            .finish(msg, label::FILL_PAGE_REQUEST);
    }

    /// Decodes a request.
    pub fn decode(msg: &Message) -> Result<Self, DecodeError> {
        expect_label(msg, label::FILL_PAGE_REQUEST)?;
        let mut r = expect_len(msg, 12)?;
        Ok(Self { pid: Pid::from_raw(r.u32()), addr: r.u64() })
    }
}

/// Pager to kernel: the frame to install.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillPageReply {
    /// Physical address of a frame previously obtained with `ALLOC_PAGE`.
    pub paddr: u64,
}

impl FillPageReply {
    /// Writes the reply into `msg`.
    pub fn encode(&self, msg: &mut Message) {
        Writer::new().put(&self.paddr.to_le_bytes()).finish(msg, label::FILL_PAGE_REPLY);
    }

    /// Decodes a reply.
    pub fn decode(msg: &Message) -> Result<Self, DecodeError> {
        expect_label(msg, label::FILL_PAGE_REPLY)?;
        let mut r = expect_len(msg, 8)?;
        Ok(Self { paddr: r.u64() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_pager_layout() {
        let req = KernelRequest::AddPager {
            pid: Pid::from_raw(2),
            pager: Cid::from_raw(3),
            start: 0x1000,
            size: 0x2000,
            attrs: PageAttrs::READABLE | PageAttrs::WRITABLE,
        };
        let mut msg = Message::new();
        req.encode(&mut msg);
        assert_eq!(msg.label(), label::ADD_PAGER);
        assert_eq!(msg.payload().len(), 25);
        assert_eq!(&msg.payload()[..8], &[2, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(msg.payload()[24], 0b11);
        assert_eq!(KernelRequest::decode(&msg), Ok(req));
    }

    #[test]
    fn unknown_label_rejected_before_payload() {
        let mut msg = Message::new();
        msg.set(999, &[1, 2, 3]).unwrap();
        assert_eq!(KernelRequest::decode(&msg), Err(DecodeError::UnknownLabel(999)));
    }

    #[test]
    fn truncated_payload_rejected() {
        let mut msg = Message::new();
        msg.set(label::SPAWN_THREAD, &[0; 20]).unwrap();
        assert_eq!(
            KernelRequest::decode(&msg),
            Err(DecodeError::BadLength { label: label::SPAWN_THREAD, len: 20 })
        );
    }

    #[test]
    fn unknown_attribute_bits_rejected() {
        let mut msg = Message::new();
        KernelRequest::AddPager {
            pid: Pid::from_raw(1),
            pager: Cid::from_raw(2),
            start: 0,
            size: 0,
            attrs: PageAttrs::READABLE,
        }
        .encode(&mut msg);
        let mut raw = [0u8; 25];
        raw.copy_from_slice(msg.payload());
        raw[24] = 0x80;
        msg.set(label::ADD_PAGER, &raw).unwrap();
        assert_eq!(KernelRequest::decode(&msg), Err(DecodeError::BadField));
    }

    #[test]
    fn fill_page_request_checks_label() {
        let mut msg = Message::new();
        FillPageRequest { pid: Pid::from_raw(4), addr: 0x1000 }.encode(&mut msg);
        assert_eq!(
            FillPageRequest::decode(&msg),
            Ok(FillPageRequest { pid: Pid::from_raw(4), addr: 0x1000 })
        );
        assert_eq!(FillPageReply::decode(&msg), Err(DecodeError::UnknownLabel(label::FILL_PAGE_REQUEST)));
    }

    #[test]
    fn create_process_reply_layout() {
        let reply = KernelReply::CreateProcess {
            pid: Pid::from_raw(5),
            pager_ch: Cid::from_raw(2),
            child_ch: Cid::from_raw(2),
        };
        let mut msg = Message::new();
        reply.encode(&mut msg);
        assert_eq!(msg.payload(), &[5, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(KernelReply::decode(&msg), Ok(reply));
    }
}
