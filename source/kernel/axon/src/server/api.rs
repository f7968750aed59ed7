// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel server handlers.
//!
//! Every handler follows decode -> check -> execute: typed arguments are pulled
//! out of the request, validated without side effects, then applied.

extern crate alloc;

use alloc::format;

use axon_abi::proto::{KernelReply, KernelRequest};
use axon_abi::{label, PageAttrs};

use crate::kernel::{HaltReason, Kernel};
use crate::server::{Disposition, Request, ServerTable};
use crate::types::{is_page_aligned, ChannelRef, Cid, Pid, VirtAddr};
use crate::vm::{attrs_admissible, Pager, Region};
use crate::Error;

/// Registers every kernel server handler.
pub fn install_handlers(table: &mut ServerTable) {
    table.register(label::PRINTCHAR, srv_printchar);
    table.register(label::EXIT_CURRENT, srv_exit_current);
    table.register(label::CREATE_PROCESS, srv_create_process);
    table.register(label::SPAWN_THREAD, srv_spawn_thread);
    table.register(label::ADD_PAGER, srv_add_pager);
    table.register(label::EXIT_KERNEL_TEST, srv_exit_kernel_test);
    table.register(label::ALLOC_PAGE, srv_alloc_page);
}

fn to_addr(raw: u64) -> Result<VirtAddr, Error> {
    VirtAddr::try_from(raw).map_err(|_| Error::InvalidArgs)
}

#[derive(Debug, Clone, Copy)]
struct SpawnThreadArgsTyped {
    pid: Pid,
    entry: VirtAddr,
    stack: VirtAddr,
    buffer: VirtAddr,
    arg: usize,
}

impl SpawnThreadArgsTyped {
    #[inline]
    fn decode(request: &Request) -> Result<Self, Error> {
        let KernelRequest::SpawnThread { pid, entry, stack, buffer, arg } = request.body else {
            return Err(Error::InvalidMessage);
        };
        Ok(Self {
            pid,
            entry: to_addr(entry)?,
            stack: to_addr(stack)?,
            buffer: to_addr(buffer)?,
            arg: usize::try_from(arg).map_err(|_| Error::InvalidArgs)?,
        })
    }

    #[inline]
    fn check(&self, kernel: &Kernel) -> Result<(), Error> {
        if kernel.process(self.pid).is_none() {
            return Err(Error::NotFound);
        }
        if self.pid == kernel.kernel_pid() {
            return Err(Error::NotPermitted);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct AddPagerArgsTyped {
    pid: Pid,
    pager: Cid,
    start: VirtAddr,
    size: usize,
    attrs: PageAttrs,
}

impl AddPagerArgsTyped {
    #[inline]
    fn decode(request: &Request) -> Result<Self, Error> {
        let KernelRequest::AddPager { pid, pager, start, size, attrs } = request.body else {
            return Err(Error::InvalidMessage);
        };
        Ok(Self {
            pid,
            pager,
            start: to_addr(start)?,
            size: usize::try_from(size).map_err(|_| Error::InvalidArgs)?,
            attrs: attrs | PageAttrs::USER,
        })
    }

    /// Argument checks that run before anything is touched.
    #[inline]
    fn check(&self) -> Result<(), Error> {
        if !attrs_admissible(self.attrs) {
            return Err(Error::InvalidArgs);
        }
        if self.size == 0 || !is_page_aligned(self.start) || !is_page_aligned(self.size) {
            return Err(Error::InvalidArgs);
        }
        Ok(())
    }
}

fn srv_printchar(kernel: &mut Kernel, request: &Request) -> Result<Disposition, Error> {
    let KernelRequest::PrintChar { ch } = request.body else {
        return Err(Error::InvalidMessage);
    };
    kernel.console.write_byte(ch);
    Ok(Disposition::Reply(KernelReply::PrintChar))
}

fn srv_exit_current(kernel: &mut Kernel, request: &Request) -> Result<Disposition, Error> {
    let KernelRequest::ExitCurrent { code } = request.body else {
        return Err(Error::InvalidMessage);
    };
    if request.sender == kernel.kernel_pid() {
        return Err(Error::NotPermitted);
    }
    log::info!(target: "server", "process {} exited with {}", request.sender.as_raw(), code);
    kernel.teardown_process(request.sender);
    Ok(Disposition::NoReply)
}

fn srv_create_process(kernel: &mut Kernel, request: &Request) -> Result<Disposition, Error> {
    let KernelRequest::CreateProcess = request.body else {
        return Err(Error::InvalidMessage);
    };
    let sender = request.sender;
    let pid = kernel.process_create(&format!("child-of-{}", sender.as_raw()))?;

    let linked = kernel.channel_create(pid).and_then(|child_ch| {
        let pager_ch = kernel.channel_create(sender)?;
        let link = kernel.channel_link(ChannelRef::new(sender, pager_ch), ChannelRef::new(pid, child_ch));
        if let Err(err) = link {
            kernel.decref_channel(ChannelRef::new(sender, pager_ch))?;
            return Err(err);
        }
        Ok((pager_ch, child_ch))
    });
    match linked {
        Ok((pager_ch, child_ch)) => {
            log::info!(
                target: "server",
                "pid {} created pid {} (link {} <-> {})",
                sender.as_raw(),
                pid.as_raw(),
                pager_ch.as_raw(),
                child_ch.as_raw()
            );
            Ok(Disposition::Reply(KernelReply::CreateProcess { pid, pager_ch, child_ch }))
        }
        Err(err) => {
            kernel.teardown_process(pid);
            Err(err)
        }
    }
}

fn srv_spawn_thread(kernel: &mut Kernel, request: &Request) -> Result<Disposition, Error> {
    let args = SpawnThreadArgsTyped::decode(request)?;
    args.check(kernel)?;
    let tid = kernel.thread_create(args.pid, args.entry, args.stack, args.buffer, args.arg)?;
    if let Err(err) = kernel.thread_resume(tid) {
        kernel.thread_destroy(tid)?;
        return Err(err);
    }
    Ok(Disposition::Reply(KernelReply::SpawnThread { tid }))
}

fn srv_add_pager(kernel: &mut Kernel, request: &Request) -> Result<Disposition, Error> {
    let args = AddPagerArgsTyped::decode(request)?;
    args.check()?;
    let Some(target) = kernel.process(args.pid) else {
        return Err(Error::InvalidMessage);
    };
    let has_channel = target.channel(args.pager).is_some();
    let destroyable = args.pid != kernel.kernel_pid();

    if !has_channel {
        log::warn!(
            target: "server",
            "ADD_PAGER: pid {} has no channel {}",
            args.pid.as_raw(),
            args.pager.as_raw()
        );
        if destroyable {
            kernel.teardown_process(args.pid);
        }
        return Err(Error::InvalidMessage);
    }
    let region = Region::new(args.start, args.size, args.attrs, Pager::Channel(args.pager))
        .map_err(Error::from)
        .and_then(|region| kernel.region_add(args.pid, region));
    if let Err(err) = region {
        log::warn!(target: "server", "ADD_PAGER: region rejected for pid {}: {}", args.pid.as_raw(), err);
        if destroyable {
            kernel.teardown_process(args.pid);
        }
        return Err(err);
    }
    Ok(Disposition::Reply(KernelReply::AddPager))
}

fn srv_exit_kernel_test(kernel: &mut Kernel, request: &Request) -> Result<Disposition, Error> {
    log::info!(target: "server", "kernel test exit requested by pid {}", request.sender.as_raw());
    kernel.halted = Some(HaltReason::TestExit);
    Ok(Disposition::NoReply)
}

fn srv_alloc_page(kernel: &mut Kernel, request: &Request) -> Result<Disposition, Error> {
    let pa = kernel.mem.alloc_zeroed().map_err(|_| Error::OutOfResource)?;
    kernel.grants.insert(pa, request.sender);
    log::debug!(target: "server", "granted frame {:#x} to pid {}", pa, request.sender.as_raw());
    Ok(Disposition::Reply(KernelReply::AllocPage { paddr: pa as u64 }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_pager(attrs: PageAttrs, start: u64, size: u64) -> Request {
        Request {
            sender: Pid::from_raw(2),
            from: Cid::from_raw(1),
            body: KernelRequest::AddPager {
                pid: Pid::from_raw(2),
                pager: Cid::from_raw(2),
                start,
                size,
                attrs,
            },
        }
    }

    #[test]
    fn add_pager_check_rejects_bad_attributes() {
        let rw = PageAttrs::READABLE | PageAttrs::WRITABLE;
        assert!(AddPagerArgsTyped::decode(&add_pager(rw, 0x1000, 0x1000)).unwrap().check().is_ok());

        let wx = PageAttrs::WRITABLE | PageAttrs::EXECUTABLE;
        let args = AddPagerArgsTyped::decode(&add_pager(wx, 0x1000, 0x1000)).unwrap();
        assert_eq!(args.check(), Err(Error::InvalidArgs));

        let args = AddPagerArgsTyped::decode(&add_pager(PageAttrs::empty(), 0x1000, 0x1000)).unwrap();
        assert_eq!(args.check(), Err(Error::InvalidArgs));

        let args = AddPagerArgsTyped::decode(&add_pager(PageAttrs::WRITABLE, 0x1000, 0x1000)).unwrap();
        assert_eq!(args.check(), Err(Error::InvalidArgs));
    }

    #[test]
    fn add_pager_adds_user_and_checks_alignment() {
        let args = AddPagerArgsTyped::decode(&add_pager(PageAttrs::READABLE, 0x1000, 0x1000)).unwrap();
        assert!(args.attrs.contains(PageAttrs::USER));

        let args = AddPagerArgsTyped::decode(&add_pager(PageAttrs::READABLE, 0x1001, 0x1000)).unwrap();
        assert_eq!(args.check(), Err(Error::InvalidArgs));
        let args = AddPagerArgsTyped::decode(&add_pager(PageAttrs::READABLE, 0x1000, 0)).unwrap();
        assert_eq!(args.check(), Err(Error::InvalidArgs));
    }

    #[test]
    fn typed_decode_rejects_other_requests() {
        let request = Request {
            sender: Pid::from_raw(2),
            from: Cid::from_raw(1),
            body: KernelRequest::AllocPage,
        };
        assert_eq!(SpawnThreadArgsTyped::decode(&request).err(), Some(Error::InvalidMessage));
        assert_eq!(AddPagerArgsTyped::decode(&request).err(), Some(Error::InvalidMessage));
    }

    #[test]
    fn table_dispatches_by_label() {
        let mut table = ServerTable::new();
        install_handlers(&mut table);
        assert!(table.handler(label::PRINTCHAR).is_some());
        assert!(table.handler(label::ALLOC_PAGE).is_some());
        assert!(table.handler(label::PRINTCHAR_REPLY).is_none());
        assert!(table.handler(-5).is_none());
        assert!(table.handler(1000).is_none());
    }
}
