// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Message envelope: a 16-byte header followed by an inline payload.

use crate::{Cid, ErrorCode, Pid};

/// Length of the encoded header in bytes.
pub const MSG_HEADER_LEN: usize = 16;
/// Bits of `MsgHeader::info` holding the payload length.
pub const MSG_LEN_MASK: u32 = 0xfff;
/// Largest payload a message can carry.
pub const MAX_PAYLOAD: usize = MSG_LEN_MASK as usize;

/// Header shared between kernel and userland.
///
/// `src` and `from` are written by the kernel on delivery; whatever the sender
/// stored there is overwritten.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// Message type; negative values carry an [`ErrorCode`].
    pub label: i32,
    /// Low 12 bits: payload length. Remaining bits are reserved and zero.
    pub info: u32,
    /// Process that sent the message.
    pub src: Pid,
    /// Receiver-side channel the message arrived on.
    pub from: Cid,
}

const _: () = assert!(core::mem::size_of::<MsgHeader>() == MSG_HEADER_LEN);

impl MsgHeader {
    /// Creates a header with the given label and payload length.
    pub const fn new(label: i32, len: usize) -> Self {
        Self { label, info: (len as u32) & MSG_LEN_MASK, src: Pid::from_raw(0), from: Cid::ANY }
    }

    /// Payload length encoded in `info`.
    pub const fn len(&self) -> usize {
        (self.info & MSG_LEN_MASK) as usize
    }

    /// Returns `true` when the header announces no payload.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialises the header to little-endian bytes.
    pub fn to_le_bytes(&self) -> [u8; MSG_HEADER_LEN] {
        let mut buf = [0u8; MSG_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.label.to_le_bytes());
        buf[4..8].copy_from_slice(&self.info.to_le_bytes());
        buf[8..12].copy_from_slice(&self.src.as_raw().to_le_bytes());
        buf[12..16].copy_from_slice(&self.from.as_raw().to_le_bytes());
        buf
    }

    /// Deserialises a header from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; MSG_HEADER_LEN]) -> Self {
        Self {
            label: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            info: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            src: Pid::from_raw(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]])),
            from: Cid::from_raw(i32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]])),
        }
    }
}

/// Fixed-size message buffer. Every thread owns one.
#[repr(C)]
#[derive(Clone)]
pub struct Message {
    /// Envelope.
    pub header: MsgHeader,
    payload: [u8; MAX_PAYLOAD],
}

impl Message {
    /// Empty message with label zero.
    pub const fn new() -> Self {
        Self { header: MsgHeader::new(0, 0), payload: [0; MAX_PAYLOAD] }
    }

    /// Empty message carrying `label`.
    pub const fn with_label(label: i32) -> Self {
        let mut msg = Self::new();
        msg.header.label = label;
        msg
    }

    /// Current label.
    pub const fn label(&self) -> i32 {
        self.header.label
    }

    /// Returns the error carried by a negative label, if any.
    pub fn error(&self) -> Option<ErrorCode> {
        ErrorCode::from_label(self.header.label)
    }

    /// `Ok(label)` for a regular message, `Err` for an error reply.
    pub fn status(&self) -> crate::Result<i32> {
        match self.error() {
            Some(code) => Err(code),
            None => Ok(self.header.label),
        }
    }

    /// Turns the buffer into an error reply without payload.
    pub fn set_error(&mut self, code: ErrorCode) {
        self.header = MsgHeader::new(code.label(), 0);
    }

    /// Valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.header.len()]
    }

    /// Replaces label and payload.
    pub fn set(&mut self, label: i32, payload: &[u8]) -> crate::Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(ErrorCode::InvalidArgs);
        }
        self.payload[..payload.len()].copy_from_slice(payload);
        self.header = MsgHeader::new(label, payload.len());
        Ok(())
    }

    /// Copies header and valid payload bytes from `other`.
    pub fn copy_from(&mut self, other: &Message) {
        let len = other.header.len();
        self.header = other.header;
        self.payload[..len].copy_from_slice(&other.payload[..len]);
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("payload", &self.payload())
            .finish()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.payload() == other.payload()
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER_V1: &[u8; MSG_HEADER_LEN] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/vectors/msg_header_v1.bin"));

    #[test]
    fn header_golden_vector() {
        let header = MsgHeader {
            label: 0x0102_0304,
            info: 0x0abc,
            src: Pid::from_raw(0x1122_3344),
            from: Cid::from_raw(0x5566_7788),
        };
        assert_eq!(&header.to_le_bytes(), HEADER_V1);
        assert_eq!(MsgHeader::from_le_bytes(*HEADER_V1), header);
        assert_eq!(header.len(), 0xabc);
    }

    #[test]
    fn length_is_masked_to_twelve_bits() {
        let header = MsgHeader::new(1, 0x1_0005);
        assert_eq!(header.len(), 5);
    }

    #[test]
    fn copy_moves_only_valid_bytes() {
        let mut a = Message::new();
        a.set(7, b"hello").unwrap();
        let mut b = Message::new();
        b.set(9, b"zzzzzzzzzz").unwrap();
        b.copy_from(&a);
        assert_eq!(b.payload(), b"hello");
        assert_eq!(b.label(), 7);
        assert_eq!(b, a);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut msg = Message::new();
        let big = [0u8; MAX_PAYLOAD + 1];
        assert_eq!(msg.set(1, &big), Err(ErrorCode::InvalidArgs));
        assert!(msg.set(1, &big[..MAX_PAYLOAD]).is_ok());
        assert_eq!(msg.payload().len(), MAX_PAYLOAD);
    }

    #[test]
    fn error_reply_status() {
        let mut msg = Message::with_label(3);
        assert_eq!(msg.status(), Ok(3));
        msg.set_error(ErrorCode::NotFound);
        assert_eq!(msg.status(), Err(ErrorCode::NotFound));
        assert!(msg.payload().is_empty());
    }
}
