// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host implementations: the console records bytes, the TLB counts flushes.

extern crate alloc;

use alloc::{string::String, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{Console, Tlb};

/// Console that keeps everything written to it.
#[derive(Default)]
pub struct CaptureConsole {
    bytes: Mutex<Vec<u8>>,
}

impl CaptureConsole {
    pub const fn new() -> Self {
        Self { bytes: Mutex::new(Vec::new()) }
    }

    /// Output so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

impl Console for CaptureConsole {
    fn write_byte(&self, byte: u8) {
        self.bytes.lock().push(byte);
    }
}

/// TLB stand-in that only counts invalidations.
#[derive(Default)]
pub struct CountingTlb {
    flushes: AtomicUsize,
}

impl CountingTlb {
    pub const fn new() -> Self {
        Self { flushes: AtomicUsize::new(0) }
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Tlb for CountingTlb {
    fn flush_all(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
