// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod host;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod virt;

pub use host::{CaptureConsole, CountingTlb};

/// Byte sink used by the kernel console and the logger.
pub trait Console: Send + Sync {
    /// Writes a single byte.
    fn write_byte(&self, byte: u8);

    fn write_str(&self, text: &str) {
        for byte in text.bytes() {
            self.write_byte(byte);
        }
    }
}

/// TLB management operations.
pub trait Tlb: Send + Sync {
    /// Flushes the entire translation cache.
    fn flush_all(&self);
}
