// This file is part of fpga-dma, a user-space DMA engine for FPGA accelerators.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// fpga-dma is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// fpga-dma is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! Waiting for the hardware and retiring what it has finished.
//!
//! Descriptors complete in the order they were queued, so everything that has to happen
//! after a descriptor completes is kept in one FIFO keyed by the descriptor's ticket.
//! Retiring an entry frees a bounce slot, copies a bounce slot out to its destination,
//! or finishes a transfer.

use crate::buffer::DmaRegion;
use crate::config::PollPolicy;
use crate::transfer::{ScratchBuffer, TransferCallback, TransferOutcome};
use log::trace;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Decides what to do between two unsuccessful polls.
pub trait CompletionStrategy: Send {
    /// Called before poll number `attempt + 1`. Returning `false` gives up.
    fn pause(&self, attempt: u64) -> bool;
}

/// Busy polling with backoff: spin, then yield, then sleep.
impl CompletionStrategy for PollPolicy {
    fn pause(&self, attempt: u64) -> bool {
        if attempt >= self.max_polls {
            return false;
        }
        if attempt >= self.sleep_after && !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        } else if attempt >= self.yield_after as u64 {
            std::thread::yield_now();
        } else {
            std::hint::spin_loop();
        }
        true
    }
}

/// Bookkeeping of one start of a transfer.
pub(crate) struct Completion {
    pending: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    callback: Option<TransferCallback>,
    outcome: TransferOutcome,
    /// Keeps a small transfer's scratch memory mapped while descriptors use it.
    scratch: Option<Arc<ScratchBuffer>>,
}

impl Completion {
    pub(crate) fn new(
        pending: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        callback: Option<TransferCallback>,
        scratch: Option<Arc<ScratchBuffer>>,
    ) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        in_flight.fetch_add(1, Ordering::AcqRel);
        Completion {
            pending,
            in_flight,
            callback,
            outcome: TransferOutcome::Completed,
            scratch,
        }
    }

    /// Record a failure seen while the transfer was still being queued.
    pub(crate) fn fail(&mut self, outcome: TransferOutcome) {
        if self.outcome == TransferOutcome::Completed {
            self.outcome = outcome;
        }
    }

    /// Release the scratch memory, drop the counters and run the callback.
    ///
    /// `outcome` overrides whatever was recorded while queueing.
    pub(crate) fn finish(self, outcome: Option<TransferOutcome>) {
        let Completion {
            pending,
            in_flight,
            callback,
            outcome: recorded,
            scratch,
        } = self;
        drop(scratch);
        pending.fetch_sub(1, Ordering::AcqRel);
        in_flight.fetch_sub(1, Ordering::AcqRel);
        let outcome = outcome.unwrap_or(recorded);
        trace!("Transfer finished: {outcome:?}");
        if let Some(callback) = callback {
            callback(outcome);
        }
    }
}

pub(crate) enum Retire {
    /// A bounce slot that was read by the device.
    FreeSlot(usize),
    /// A bounce slot written by the device, to be copied to its destination.
    CopyOut { slot: usize, dst: DmaRegion },
    Finish(Completion),
}

/// Retire actions in ticket order.
#[derive(Default)]
pub(crate) struct RetireQueue {
    entries: VecDeque<(u64, Retire)>,
}

impl RetireQueue {
    pub(crate) fn push(&mut self, ticket: u64, action: Retire) {
        self.entries.push_back((ticket, action));
    }

    /// Pop the next action whose descriptor has completed.
    pub(crate) fn pop_done(&mut self, completed: u64) -> Option<Retire> {
        match self.entries.front() {
            Some((ticket, _)) if *ticket <= completed => {
                self.entries.pop_front().map(|(_, action)| action)
            }
            _ => None,
        }
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Retire> + '_ {
        self.entries.drain(..).map(|(_, action)| action)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether some host bytes are still waiting in a bounce slot.
    pub(crate) fn has_copy_out(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, action)| matches!(action, Retire::CopyOut { .. }))
    }
}
