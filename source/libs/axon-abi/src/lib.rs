// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI between the AXON kernel and user processes
//! OWNERS: @runtime
//! PUBLIC API: Pid/Tid/Cid, IpcFlags, PageAttrs, ErrorCode, MsgHeader, Message, proto::*
//! DEPENDS_ON: bitflags
//! INVARIANTS: Header is 16 bytes LE; payload length fits in 12 bits; negative labels are error codes

use bitflags::bitflags;

mod msg;
pub mod proto;

pub use msg::{Message, MsgHeader, MAX_PAYLOAD, MSG_HEADER_LEN, MSG_LEN_MASK};

/// Result type returned by ABI helpers.
pub type Result<T> = core::result::Result<T, ErrorCode>;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Process identifier.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// Wraps a raw process id.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Thread identifier, unique across processes.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u32);

impl Tid {
    /// Wraps a raw thread id.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Channel identifier, scoped to the process that owns the channel.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid(i32);

impl Cid {
    /// Receive from any channel of the calling process.
    pub const ANY: Cid = Cid(0);
    /// Never matches; marks an exhausted mailbox.
    pub const DENY: Cid = Cid(-1);
    /// Channel every user process holds towards the kernel server.
    pub const KERNEL: Cid = Cid(1);

    /// Wraps a raw channel id.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

bitflags! {
    /// Operation flags accepted by the `ipc` entry point.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IpcFlags: u32 {
        /// Send the caller's buffer.
        const SEND = 1 << 16;
        /// Receive into the caller's buffer.
        const RECV = 1 << 17;
        /// Fail with `WouldBlock` instead of suspending.
        const NOBLOCK = 1 << 18;
        /// Call issued by the kernel on behalf of a thread.
        const KERNEL = 1 << 19;
        /// Send, then wait for the reply on the same channel.
        const CALL = Self::SEND.bits() | Self::RECV.bits();
    }
}

bitflags! {
    /// Access attributes of a memory region.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageAttrs: u8 {
        /// Loads permitted.
        const READABLE = 1 << 0;
        /// Stores permitted.
        const WRITABLE = 1 << 1;
        /// Instruction fetch permitted.
        const EXECUTABLE = 1 << 2;
        /// Accessible from user mode.
        const USER = 1 << 3;
    }
}

/// Error codes carried in negative message labels.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// No physical frame available.
    NoMemory = -1,
    /// An id table or queue is full.
    OutOfResource = -2,
    /// Object already exists.
    AlreadyExists = -3,
    /// Referenced object does not exist.
    NotFound = -4,
    /// Malformed message or reference.
    InvalidMessage = -5,
    /// Argument outside the accepted domain.
    InvalidArgs = -6,
    /// Operation would have blocked under `NOBLOCK`.
    WouldBlock = -7,
    /// Peer channel is unlinked or destroyed.
    PeerGone = -8,
    /// Channel already has a peer.
    AlreadyLinked = -9,
    /// Caller may not perform the operation.
    NotPermitted = -10,
    /// The process was aborted.
    Aborted = -11,
}

impl ErrorCode {
    const ALL: [ErrorCode; 11] = [
        ErrorCode::NoMemory,
        ErrorCode::OutOfResource,
        ErrorCode::AlreadyExists,
        ErrorCode::NotFound,
        ErrorCode::InvalidMessage,
        ErrorCode::InvalidArgs,
        ErrorCode::WouldBlock,
        ErrorCode::PeerGone,
        ErrorCode::AlreadyLinked,
        ErrorCode::NotPermitted,
        ErrorCode::Aborted,
    ];

    /// Returns the label value carrying this error.
    pub const fn label(self) -> i32 {
        self as i32
    }

    /// Interprets a negative label. Unknown negative values map to `InvalidMessage`.
    pub fn from_label(label: i32) -> Option<Self> {
        if label >= 0 {
            return None;
        }
        Some(
            Self::ALL
                .iter()
                .copied()
                .find(|code| code.label() == label)
                .unwrap_or(ErrorCode::InvalidMessage),
        )
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            ErrorCode::NoMemory => "no memory",
            ErrorCode::OutOfResource => "out of resource",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::NotFound => "not found",
            ErrorCode::InvalidMessage => "invalid message",
            ErrorCode::InvalidArgs => "invalid arguments",
            ErrorCode::WouldBlock => "would block",
            ErrorCode::PeerGone => "peer gone",
            ErrorCode::AlreadyLinked => "already linked",
            ErrorCode::NotPermitted => "not permitted",
            ErrorCode::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// Message labels understood by the kernel server and the pager protocol.
pub mod label {
    /// Write one byte to the kernel console.
    pub const PRINTCHAR: i32 = 1;
    /// Reply to [`PRINTCHAR`].
    pub const PRINTCHAR_REPLY: i32 = 2;
    /// Terminate the sending process.
    pub const EXIT_CURRENT: i32 = 3;
    /// Create a process linked to the requester.
    pub const CREATE_PROCESS: i32 = 4;
    /// Reply to [`CREATE_PROCESS`].
    pub const CREATE_PROCESS_REPLY: i32 = 5;
    /// Create and resume a thread.
    pub const SPAWN_THREAD: i32 = 6;
    /// Reply to [`SPAWN_THREAD`].
    pub const SPAWN_THREAD_REPLY: i32 = 7;
    /// Register a channel-backed region.
    pub const ADD_PAGER: i32 = 8;
    /// Reply to [`ADD_PAGER`].
    pub const ADD_PAGER_REPLY: i32 = 9;
    /// Halt the kernel at the end of a test run.
    pub const EXIT_KERNEL_TEST: i32 = 10;
    /// Obtain a zeroed physical frame.
    pub const ALLOC_PAGE: i32 = 11;
    /// Reply to [`ALLOC_PAGE`].
    pub const ALLOC_PAGE_REPLY: i32 = 12;
    /// Kernel asks a pager for the page backing an address.
    pub const FILL_PAGE_REQUEST: i32 = 13;
    /// Pager answer to [`FILL_PAGE_REQUEST`].
    pub const FILL_PAGE_REPLY: i32 = 14;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_labels_round_trip() {
        for code in ErrorCode::ALL {
            assert!(code.label() < 0);
            assert_eq!(ErrorCode::from_label(code.label()), Some(code));
        }
        assert_eq!(ErrorCode::from_label(0), None);
        assert_eq!(ErrorCode::from_label(7), None);
        assert_eq!(ErrorCode::from_label(-999), Some(ErrorCode::InvalidMessage));
    }

    #[test]
    fn call_is_send_and_recv() {
        assert_eq!(IpcFlags::CALL, IpcFlags::SEND | IpcFlags::RECV);
        assert_eq!(IpcFlags::SEND.bits(), 0x1_0000);
        assert_eq!(IpcFlags::KERNEL.bits(), 0x8_0000);
    }

    #[test]
    fn reserved_channel_ids() {
        assert_eq!(Cid::ANY.as_raw(), 0);
        assert_eq!(Cid::DENY.as_raw(), -1);
        assert_ne!(Cid::KERNEL, Cid::ANY);
    }
}
