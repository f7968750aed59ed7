// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the kernel scenario tests.

#![allow(dead_code)]

use std::sync::Arc;

use axon::abi::proto::KernelRequest;
use axon::abi::{Cid, IpcFlags, Message};
use axon::hal::{CaptureConsole, CountingTlb};
use axon::types::{Pid, Tid};
use axon::{IpcStatus, Kernel, KernelConfig};

pub struct Booted {
    pub kernel: Kernel,
    pub console: Arc<CaptureConsole>,
    pub tlb: Arc<CountingTlb>,
}

pub fn boot() -> Booted {
    boot_with(KernelConfig::new().with_frames(256))
}

pub fn boot_with(config: KernelConfig) -> Booted {
    let console = Arc::new(CaptureConsole::new());
    let tlb = Arc::new(CountingTlb::new());
    let kernel = Kernel::with_hal(config, console.clone(), tlb.clone()).expect("boot");
    Booted { kernel, console, tlb }
}

/// Creates and resumes a thread in `pid`.
pub fn start_thread(kernel: &mut Kernel, pid: Pid) -> Tid {
    let tid = kernel.thread_create(pid, 0x1_0000, 0x4000_0000, 0, 0).expect("thread_create");
    kernel.thread_resume(tid).expect("thread_resume");
    tid
}

/// Sends `request` to the kernel server over the reserved channel and returns the reply.
pub fn kernel_call(kernel: &mut Kernel, tid: Tid, request: KernelRequest) -> Message {
    request.encode(kernel.message_mut(tid).expect("user thread"));
    assert_eq!(kernel.ipc(tid, Cid::KERNEL, IpcFlags::CALL), Ok(IpcStatus::Completed));
    kernel.thread(tid).expect("caller alive").message().clone()
}
