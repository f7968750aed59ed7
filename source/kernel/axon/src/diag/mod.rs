// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel diagnostics: logging backend, process listing, registry invariants
//! OWNERS: @kernel-team
//! PUBLIC API: log::init, ProcessInfo, Kernel::processes, Kernel::check_invariants
//! DEPENDS_ON: task registry, mm page tables

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::kernel::Kernel;
use crate::task::ThreadState;
use crate::types::{Pid, Tid};

pub mod invariants;
pub mod log;

pub use invariants::InvariantViolation;

/// One row of the process listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub threads: Vec<(Tid, ThreadState)>,
    pub channels: usize,
    pub regions: usize,
    pub mapped_pages: usize,
}

impl Kernel {
    /// Snapshot of every live process, in pid order.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.processes
            .iter()
            .map(|(_, process)| ProcessInfo {
                pid: process.pid(),
                name: String::from(process.name()),
                threads: process
                    .threads()
                    .iter()
                    .filter_map(|&tid| self.thread(tid).map(|t| (tid, t.state())))
                    .collect(),
                channels: process.channels.len(),
                regions: process.regions.len(),
                mapped_pages: process.space.mappings(&self.mem).len(),
            })
            .collect()
    }

    /// Returns the first registry inconsistency found, if any.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        invariants::check(self)
    }

    #[cfg(feature = "debug_invariants")]
    pub(crate) fn assert_invariants(&self) {
        if let Err(violation) = self.check_invariants() {
            panic!("kernel invariant broken: {violation}");
        }
    }
}
