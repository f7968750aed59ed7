// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON microkernel core: page tables, process/thread/channel registry,
//!          rendezvous IPC, external pagers and the privileged kernel server
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelConfig, Error, IpcStatus, vm::{Access, FaultOutcome}, loader, diag
//! DEPENDS_ON: axon-abi, hal (console, TLB)
//! INVARIANTS: Single core, cooperative; `Kernel` is neither Send nor Sync

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

pub mod config;
pub mod diag;
pub mod error;
pub mod hal;
pub mod idtable;
pub mod ipc;
mod kernel;
pub mod loader;
pub mod mm;
pub mod sched;
pub mod server;
pub mod task;
pub mod types;
pub mod vm;

pub use axon_abi as abi;
pub use config::KernelConfig;
pub use error::Error;
pub use ipc::IpcStatus;
pub use kernel::{HaltReason, Kernel};
pub use vm::{AbortReason, Access, FaultOutcome};
