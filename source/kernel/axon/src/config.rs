// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Static kernel limits. Defaults match the QEMU `virt` bring-up profile.

/// First physical address of the frame pool (QEMU `virt` DRAM base).
pub const DEFAULT_PHYS_BASE: usize = 0x8000_0000;
/// Frames in the pool (4 MiB).
pub const DEFAULT_FRAMES: usize = 1024;
pub const DEFAULT_MAX_PROCESSES: usize = 64;
pub const DEFAULT_MAX_THREADS: usize = 256;
/// Channels per process, including the reserved kernel channel.
pub const DEFAULT_MAX_CHANNELS: usize = 64;

/// Limits applied when the kernel is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub phys_base: usize,
    pub frames: usize,
    pub max_processes: usize,
    pub max_threads: usize,
    pub max_channels: usize,
    /// Must be at least `max_threads` so wake-ups never find the queue full.
    pub ready_queue_capacity: usize,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            phys_base: DEFAULT_PHYS_BASE,
            frames: DEFAULT_FRAMES,
            max_processes: DEFAULT_MAX_PROCESSES,
            max_threads: DEFAULT_MAX_THREADS,
            max_channels: DEFAULT_MAX_CHANNELS,
            ready_queue_capacity: DEFAULT_MAX_THREADS,
        }
    }

    pub const fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub const fn with_phys_base(mut self, base: usize) -> Self {
        self.phys_base = base;
        self
    }

    pub const fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    /// Also raises the ready queue so it keeps up with the thread limit.
    pub const fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        if self.ready_queue_capacity < max {
            self.ready_queue_capacity = max;
        }
        self
    }

    pub const fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = max;
        self
    }

    /// Rejects combinations the kernel cannot run with.
    pub fn validate(&self) -> Result<(), crate::Error> {
        let page_aligned = self.phys_base % crate::mm::PAGE_SIZE == 0;
        // The kernel process needs one slot, the reserved channel needs one.
        if !page_aligned
            || self.frames == 0
            || self.max_processes < 2
            || self.max_threads < 2
            || self.max_channels < 2
            || self.ready_queue_capacity < self.max_threads
        {
            return Err(crate::Error::InvalidArgs);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
