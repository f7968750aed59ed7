// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel server operations driven through the reserved channel
//! OWNERS: @kernel-team
//!
//! TEST_SCENARIOS:
//!   - PRINTCHAR, CREATE_PROCESS, SPAWN_THREAD, ALLOC_PAGE reply shapes
//!   - ADD_PAGER argument validation and target teardown
//!   - unknown labels answered with an error reply
//!   - EXIT_CURRENT and EXIT_KERNEL_TEST never reply

mod common;

use axon::abi::proto::{KernelReply, KernelRequest};
use axon::abi::{label, Cid, ErrorCode, IpcFlags, PageAttrs};
use axon::task::ThreadState;
use axon::types::{ChannelRef, Pid};
use axon::{Error, HaltReason, IpcStatus, KernelConfig};

use common::{boot, boot_with, kernel_call, start_thread};

#[test]
fn printchar_reaches_the_console() {
    let mut booted = boot();
    let kernel = &mut booted.kernel;
    let pid = kernel.process_create("hello").unwrap();
    let tid = start_thread(kernel, pid);

    for ch in *b"hi\n" {
        let reply = kernel_call(kernel, tid, KernelRequest::PrintChar { ch });
        assert_eq!(KernelReply::decode(&reply), Ok(KernelReply::PrintChar));
        assert_eq!(reply.header.src, kernel.kernel_pid());
        assert_eq!(reply.header.from, Cid::KERNEL);
    }
    assert_eq!(booted.console.contents(), "hi\n");
    assert_eq!(kernel.thread(tid).unwrap().state(), ThreadState::Running);
    assert_eq!(kernel.thread(kernel.server_tid()).unwrap().state(), ThreadState::BlockedRecv(axon::task::RecvSource::Any));
}

#[test]
fn create_process_links_parent_and_child() {
    let mut kernel = boot().kernel;
    let parent = kernel.process_create("parent").unwrap();
    let tid = start_thread(&mut kernel, parent);

    let reply = kernel_call(&mut kernel, tid, KernelRequest::CreateProcess);
    let Ok(KernelReply::CreateProcess { pid, pager_ch, child_ch }) = KernelReply::decode(&reply) else {
        panic!("unexpected reply label {}", reply.label());
    };
    assert_ne!(pager_ch, Cid::KERNEL);
    assert_ne!(child_ch, Cid::KERNEL);
    assert_eq!(
        kernel.channel(ChannelRef::new(parent, pager_ch)).unwrap().linked_to(),
        Some(ChannelRef::new(pid, child_ch))
    );
    let child = kernel.process(pid).unwrap();
    assert!(child.threads().is_empty());
    assert!(child.channel(Cid::KERNEL).unwrap().linked_to().is_some());
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn spawn_thread_starts_a_ready_thread() {
    let mut kernel = boot().kernel;
    let parent = kernel.process_create("parent").unwrap();
    let child = kernel.process_create("child").unwrap();
    let tid = start_thread(&mut kernel, parent);

    let reply = kernel_call(
        &mut kernel,
        tid,
        KernelRequest::SpawnThread { pid: child, entry: 0x1_0000, stack: 0x4000_0000, buffer: 0x3000, arg: 7 },
    );
    let Ok(KernelReply::SpawnThread { tid: spawned }) = KernelReply::decode(&reply) else {
        panic!("unexpected reply label {}", reply.label());
    };
    let thread = kernel.thread(spawned).unwrap();
    assert_eq!(thread.pid(), child);
    assert_eq!(thread.state(), ThreadState::Ready);
    assert_eq!(thread.context().entry, 0x1_0000);
    assert_eq!(thread.context().arg, 7);

    let kernel_pid = kernel.kernel_pid();
    let reply = kernel_call(
        &mut kernel,
        tid,
        KernelRequest::SpawnThread { pid: kernel_pid, entry: 0, stack: 0, buffer: 0, arg: 0 },
    );
    assert_eq!(reply.status(), Err(ErrorCode::NotPermitted));

    let reply = kernel_call(
        &mut kernel,
        tid,
        KernelRequest::SpawnThread { pid: Pid::from_raw(42), entry: 0, stack: 0, buffer: 0, arg: 0 },
    );
    assert_eq!(reply.status(), Err(ErrorCode::NotFound));
}

#[test]
fn add_pager_validates_before_touching_the_target() {
    let mut kernel = boot().kernel;
    let parent = kernel.process_create("parent").unwrap();
    let child = kernel.process_create("child").unwrap();
    let child_ch = kernel.channel_create(child).unwrap();
    let tid = start_thread(&mut kernel, parent);

    let request = |pid, pager, start, size, attrs| KernelRequest::AddPager { pid, pager, start, size, attrs };

    let wx = PageAttrs::WRITABLE | PageAttrs::EXECUTABLE;
    let reply = kernel_call(&mut kernel, tid, request(child, child_ch, 0x1000, 0x1000, wx));
    assert_eq!(reply.status(), Err(ErrorCode::InvalidArgs));
    let reply = kernel_call(&mut kernel, tid, request(child, child_ch, 0x1000, 0x1000, PageAttrs::WRITABLE));
    assert_eq!(reply.status(), Err(ErrorCode::InvalidArgs));
    let reply = kernel_call(&mut kernel, tid, request(child, child_ch, 0x1000, 0, PageAttrs::READABLE));
    assert_eq!(reply.status(), Err(ErrorCode::InvalidArgs));
    let reply = kernel_call(&mut kernel, tid, request(child, child_ch, 0x1234, 0x1000, PageAttrs::READABLE));
    assert_eq!(reply.status(), Err(ErrorCode::InvalidArgs));
    assert!(kernel.process(child).is_some());

    let reply = kernel_call(&mut kernel, tid, request(Pid::from_raw(42), child_ch, 0x1000, 0x1000, PageAttrs::READABLE));
    assert_eq!(reply.status(), Err(ErrorCode::InvalidMessage));

    let reply = kernel_call(&mut kernel, tid, request(child, child_ch, 0x1000, 0x2000, PageAttrs::READABLE));
    assert_eq!(KernelReply::decode(&reply), Ok(KernelReply::AddPager));
    assert_eq!(kernel.process(child).unwrap().regions().len(), 1);

    // Overlap is refused and costs the target its life.
    let reply = kernel_call(&mut kernel, tid, request(child, child_ch, 0x2000, 0x1000, PageAttrs::READABLE));
    assert_eq!(reply.status(), Err(ErrorCode::AlreadyExists));
    assert!(kernel.process(child).is_none());
    assert!(kernel.process(parent).is_some());
}

#[test]
fn add_pager_with_unknown_channel_destroys_the_target() {
    let mut kernel = boot().kernel;
    let parent = kernel.process_create("parent").unwrap();
    let child = kernel.process_create("child").unwrap();
    let tid = start_thread(&mut kernel, parent);

    let reply = kernel_call(
        &mut kernel,
        tid,
        KernelRequest::AddPager {
            pid: child,
            pager: Cid::from_raw(9),
            start: 0x1000,
            size: 0x1000,
            attrs: PageAttrs::READABLE,
        },
    );
    assert_eq!(reply.status(), Err(ErrorCode::InvalidMessage));
    assert!(kernel.process(child).is_none());
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn unknown_or_malformed_requests_get_error_replies() {
    let mut kernel = boot().kernel;
    let pid = kernel.process_create("client").unwrap();
    let tid = start_thread(&mut kernel, pid);

    kernel.message_mut(tid).unwrap().set(99, &[]).unwrap();
    assert_eq!(kernel.ipc(tid, Cid::KERNEL, IpcFlags::CALL), Ok(IpcStatus::Completed));
    assert_eq!(kernel.thread(tid).unwrap().message().status(), Err(ErrorCode::InvalidMessage));

    kernel.message_mut(tid).unwrap().set(label::PRINTCHAR, &[b'a', b'b']).unwrap();
    assert_eq!(kernel.ipc(tid, Cid::KERNEL, IpcFlags::CALL), Ok(IpcStatus::Completed));
    assert_eq!(kernel.thread(tid).unwrap().message().status(), Err(ErrorCode::InvalidMessage));

    // The server keeps serving.
    let reply = kernel_call(&mut kernel, tid, KernelRequest::PrintChar { ch: b'x' });
    assert_eq!(KernelReply::decode(&reply), Ok(KernelReply::PrintChar));
}

#[test]
fn alloc_page_grants_a_zeroed_frame() {
    let mut kernel = boot().kernel;
    let pid = kernel.process_create("pager").unwrap();
    let tid = start_thread(&mut kernel, pid);
    let free = kernel.phys().free_frames();

    let reply = kernel_call(&mut kernel, tid, KernelRequest::AllocPage);
    let Ok(KernelReply::AllocPage { paddr }) = KernelReply::decode(&reply) else {
        panic!("unexpected reply label {}", reply.label());
    };
    let paddr = paddr as usize;
    assert_eq!(kernel.phys().free_frames(), free - 1);
    assert!(kernel.phys().frame(paddr).unwrap().iter().all(|&b| b == 0));
    assert_eq!(kernel.granted_frames(pid).collect::<Vec<_>>(), [paddr]);

    let other = kernel.process_create("other").unwrap();
    assert_eq!(kernel.write_granted(other, paddr, 0, b"x"), Err(Error::NotPermitted));

    kernel.process_destroy(pid).unwrap();
    assert!(!kernel.phys().is_allocated(paddr));
}

#[test]
fn empty_frame_pool_reports_out_of_resource() {
    let mut kernel = boot_with(KernelConfig::new().with_frames(8)).kernel;
    let pid = kernel.process_create("hog").unwrap();
    let tid = start_thread(&mut kernel, pid);

    let mut granted = 0;
    let error = loop {
        let reply = kernel_call(&mut kernel, tid, KernelRequest::AllocPage);
        match reply.status() {
            Ok(_) => granted += 1,
            Err(code) => break code,
        }
        assert!(granted <= 8, "pool never ran dry");
    };
    assert_eq!(error, ErrorCode::OutOfResource);
    assert_eq!(kernel.phys().free_frames(), 0);

    let reply = kernel_call(&mut kernel, tid, KernelRequest::CreateProcess);
    assert_eq!(reply.status(), Err(ErrorCode::OutOfResource));
    assert_eq!(kernel.process_create("direct"), Err(Error::OutOfResource));
    assert_eq!(kernel.pids().count(), 2);
}

#[test]
fn exit_current_terminates_the_caller() {
    let mut kernel = boot().kernel;
    let free = kernel.phys().free_frames();
    let pid = kernel.process_create("short-lived").unwrap();
    let tid = start_thread(&mut kernel, pid);

    KernelRequest::ExitCurrent { code: 3 }.encode(kernel.message_mut(tid).unwrap());
    assert_eq!(kernel.ipc(tid, Cid::KERNEL, IpcFlags::CALL), Ok(IpcStatus::Terminated));
    assert!(kernel.process(pid).is_none());
    assert!(kernel.thread(tid).is_none());
    assert_eq!(kernel.phys().free_frames(), free);
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn exit_kernel_test_halts_everything() {
    let mut kernel = boot().kernel;
    let pid = kernel.process_create("test-runner").unwrap();
    let tid = start_thread(&mut kernel, pid);

    KernelRequest::ExitKernelTest.encode(kernel.message_mut(tid).unwrap());
    assert_eq!(kernel.ipc(tid, Cid::KERNEL, IpcFlags::CALL), Ok(IpcStatus::Blocked));
    assert_eq!(kernel.halted(), Some(HaltReason::TestExit));

    assert_eq!(kernel.ipc(tid, Cid::KERNEL, IpcFlags::CALL), Err(Error::Halted));
    assert_eq!(kernel.process_create("late"), Err(Error::Halted));
}
