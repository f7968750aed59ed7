// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Single-queue FIFO scheduler for user threads
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (new/enqueue/schedule_next/yield_current/finish_current/purge), EnqueueOutcome
//! INVARIANTS: Bounded queue with deterministic reject on saturation; a thread is queued at most once

extern crate alloc;

use alloc::collections::VecDeque;
use core::marker::PhantomData;

use crate::types::Tid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueRejectReason {
    QueueFull { capacity: usize },
}

#[must_use = "enqueue outcomes must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The thread was already waiting in the queue.
    AlreadyQueued,
    Rejected(EnqueueRejectReason),
}

/// Round-robin ready queue plus the currently running thread.
///
/// `!Send` and `!Sync`: the kernel is single-core and the queue is never shared.
pub struct Scheduler {
    ready: VecDeque<Tid>,
    current: Option<Tid>,
    capacity: usize,
    _not_send_sync: PhantomData<*mut ()>,
}
static_assertions::assert_not_impl_any!(Scheduler: Send, Sync);

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            ready: VecDeque::with_capacity(capacity),
            current: None,
            capacity,
            _not_send_sync: PhantomData,
        }
    }

    /// Appends `tid` to the ready queue.
    pub fn enqueue(&mut self, tid: Tid) -> EnqueueOutcome {
        if self.ready.contains(&tid) {
            return EnqueueOutcome::AlreadyQueued;
        }
        if self.ready.len() >= self.capacity {
            return EnqueueOutcome::Rejected(EnqueueRejectReason::QueueFull {
                capacity: self.capacity,
            });
        }
        self.ready.push_back(tid);
        EnqueueOutcome::Enqueued
    }

    /// Picks the next runnable thread and makes it current.
    pub fn schedule_next(&mut self) -> Option<Tid> {
        self.current = self.ready.pop_front();
        self.current
    }

    /// Re-enqueues the current thread and picks the next one.
    pub fn yield_current(&mut self) -> Option<Tid> {
        if let Some(tid) = self.current.take() {
            if matches!(self.enqueue(tid), EnqueueOutcome::Rejected(_)) {
                // Keep it running rather than dropping it.
                self.current = Some(tid);
                return self.current;
            }
        }
        self.schedule_next()
    }

    /// Clears the current thread without re-enqueuing it.
    pub fn finish_current(&mut self) {
        self.current = None;
    }

    /// Makes `tid` current, removing it from the ready queue.
    pub fn set_current(&mut self, tid: Tid) {
        self.ready.retain(|&queued| queued != tid);
        self.current = Some(tid);
    }

    /// Removes all queued references to `tid` and clears it if currently running.
    pub fn purge(&mut self, tid: Tid) {
        self.ready.retain(|&queued| queued != tid);
        if self.current == Some(tid) {
            self.current = None;
        }
    }

    pub fn current(&self) -> Option<Tid> {
        self.current
    }

    pub fn is_queued(&self, tid: Tid) -> bool {
        self.ready.contains(&tid)
    }

    /// Ready threads in dispatch order.
    pub fn ready(&self) -> impl Iterator<Item = Tid> + '_ {
        self.ready.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}
