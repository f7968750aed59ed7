// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel-wide error type and its mapping onto wire error codes.

use axon_abi::ErrorCode;

use crate::idtable::IdError;
use crate::loader::LoadError;
use crate::mm::{FrameError, MapError};
use crate::vm::RegionError;

/// Errors returned by kernel entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("out of resource")]
    OutOfResource,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no such object")]
    NotFound,
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("operation would block")]
    WouldBlock,
    #[error("peer channel gone")]
    PeerGone,
    #[error("channel already linked")]
    AlreadyLinked,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("thread is not runnable")]
    NotRunnable,
    #[error("kernel halted")]
    Halted,
    #[error("page table: {0}")]
    Map(#[from] MapError),
    #[error("region: {0}")]
    Region(#[from] RegionError),
    #[error("program image: {0}")]
    Load(#[from] LoadError),
}

impl Error {
    /// Code placed in the label of an error reply.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::OutOfResource => ErrorCode::OutOfResource,
            Error::OutOfMemory | Error::Map(MapError::OutOfMemory) => ErrorCode::NoMemory,
            Error::NotFound => ErrorCode::NotFound,
            Error::InvalidMessage => ErrorCode::InvalidMessage,
            Error::WouldBlock => ErrorCode::WouldBlock,
            Error::PeerGone => ErrorCode::PeerGone,
            Error::AlreadyLinked => ErrorCode::AlreadyLinked,
            Error::NotPermitted | Error::Map(MapError::PermissionDenied) => ErrorCode::NotPermitted,
            Error::Halted => ErrorCode::Aborted,
            Error::Region(RegionError::Overlap) | Error::Map(MapError::AlreadyMapped) => {
                ErrorCode::AlreadyExists
            }
            Error::InvalidArgs
            | Error::NotRunnable
            | Error::Map(_)
            | Error::Region(_)
            | Error::Load(_) => ErrorCode::InvalidArgs,
        }
    }
}

impl From<IdError> for Error {
    fn from(_: IdError) -> Self {
        Error::OutOfResource
    }
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::OutOfMemory => Error::OutOfMemory,
            FrameError::NotAllocated(_) => Error::InvalidArgs,
        }
    }
}

impl From<axon_abi::proto::DecodeError> for Error {
    fn from(_: axon_abi::proto::DecodeError) -> Self {
        Error::InvalidMessage
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NoMemory => Error::OutOfMemory,
            ErrorCode::OutOfResource => Error::OutOfResource,
            ErrorCode::NotFound => Error::NotFound,
            ErrorCode::WouldBlock => Error::WouldBlock,
            ErrorCode::PeerGone => Error::PeerGone,
            ErrorCode::AlreadyLinked => Error::AlreadyLinked,
            ErrorCode::NotPermitted => Error::NotPermitted,
            ErrorCode::InvalidArgs => Error::InvalidArgs,
            ErrorCode::AlreadyExists
            | ErrorCode::InvalidMessage
            | ErrorCode::Aborted => Error::InvalidMessage,
        }
    }
}
