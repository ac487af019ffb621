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

//! Transfer descriptions.
//!
//! A [`Transfer`] is a reusable set of parameters: source, destination, length, direction
//! and an optional completion callback. It is created by a channel and may only be
//! started on that channel. Starting a transfer snapshots its parameters, so the same
//! object can be changed and started again while earlier starts are still in flight.
//!
//! Transfers created with `init_small_transfer` own a scratch buffer that is mapped for
//! DMA once. Host addresses inside it are transferred directly, without staging.

use crate::buffer::{AlignedBuffer, DmaRegion};
use crate::error::{DmaError, FpgaResult};
use crate::mmio::Accelerator;
use log::{trace, warn};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferType {
    #[default]
    HostToFpga,
    FpgaToHost,
    FpgaToFpga,
}

/// What a completion callback is told about its transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed(FpgaResult),
}

pub type TransferCallback = Arc<dyn Fn(TransferOutcome) + Send + Sync>;

/// Scratch memory of a small transfer, mapped for DMA for as long as it lives.
pub(crate) struct ScratchBuffer {
    buffer: AlignedBuffer,
    iova: u64,
    accel: Arc<dyn Accelerator>,
    live: Arc<AtomicUsize>,
}

impl ScratchBuffer {
    pub(crate) fn new(
        buffer: AlignedBuffer,
        accel: Arc<dyn Accelerator>,
        live: Arc<AtomicUsize>,
    ) -> Result<Self, DmaError> {
        let iova = accel.map_dma(&buffer.region())?;
        live.fetch_add(1, Ordering::AcqRel);
        Ok(ScratchBuffer {
            buffer,
            iova,
            accel,
            live,
        })
    }

    pub(crate) fn region(&self) -> DmaRegion {
        self.buffer.region()
    }

    /// I/O address of a host address inside the buffer.
    pub(crate) fn iova_of(&self, addr: u64) -> u64 {
        self.iova + (addr - self.buffer.addr())
    }
}

impl Drop for ScratchBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.accel.unmap_dma(self.iova) {
            warn!("Failed to unmap scratch buffer {:?}: {e}", self.buffer.id());
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        trace!("Released scratch buffer {:?}", self.buffer.id());
    }
}

pub struct Transfer {
    src: u64,
    dst: u64,
    len: u64,
    kind: TransferType,
    callback: Option<TransferCallback>,
    pub(crate) scratch: Option<Arc<ScratchBuffer>>,
    pub(crate) pending: Arc<AtomicUsize>,
    pub(crate) channel: u64,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("src", &format_args!("{:#x}", self.src))
            .field("dst", &format_args!("{:#x}", self.dst))
            .field("len", &self.len)
            .field("kind", &self.kind)
            .field("callback", &self.callback.is_some())
            .field("scratch", &self.scratch_len())
            .field("pending", &self.pending())
            .finish()
    }
}

/// The parameters of one start of a transfer.
pub(crate) struct TransferSnapshot {
    pub src: u64,
    pub dst: u64,
    pub len: u64,
    pub kind: TransferType,
    pub callback: Option<TransferCallback>,
    pub scratch: Option<Arc<ScratchBuffer>>,
    pub pending: Arc<AtomicUsize>,
}

impl Transfer {
    pub(crate) fn new(channel: u64, scratch: Option<ScratchBuffer>) -> Self {
        Transfer {
            src: 0,
            dst: 0,
            len: 0,
            kind: TransferType::default(),
            callback: None,
            scratch: scratch.map(Arc::new),
            pending: Arc::new(AtomicUsize::new(0)),
            channel,
        }
    }

    pub fn set_src(&mut self, src: u64) -> &mut Self {
        self.src = src;
        self
    }

    pub fn set_dst(&mut self, dst: u64) -> &mut Self {
        self.dst = dst;
        self
    }

    pub fn set_len(&mut self, len: u64) -> &mut Self {
        self.len = len;
        self
    }

    pub fn set_type(&mut self, kind: TransferType) -> &mut Self {
        self.kind = kind;
        self
    }

    /// Make the transfer asynchronous. `None` makes it synchronous again.
    pub fn set_callback(&mut self, callback: Option<TransferCallback>) -> &mut Self {
        self.callback = callback;
        self
    }

    pub fn src(&self) -> u64 {
        self.src
    }

    pub fn dst(&self) -> u64 {
        self.dst
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn kind(&self) -> TransferType {
        self.kind
    }

    pub fn is_async(&self) -> bool {
        self.callback.is_some()
    }

    /// Starts of this transfer that have not completed yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Host address of the scratch buffer, for small transfers.
    ///
    /// The address is stable for the life of the transfer.
    pub fn scratch_addr(&self) -> Option<u64> {
        self.scratch.as_ref().map(|s| s.buffer.addr())
    }

    pub fn scratch_len(&self) -> Option<usize> {
        self.scratch.as_ref().map(|s| s.buffer.len())
    }

    /// The scratch bytes, while no start of this transfer is in flight.
    pub fn scratch(&self) -> Option<&[u8]> {
        if self.pending() != 0 {
            return None;
        }
        self.scratch.as_ref().map(|s| s.buffer.as_slice())
    }

    /// Mutable scratch bytes, while no start of this transfer is in flight.
    pub fn scratch_mut(&mut self) -> Option<&mut [u8]> {
        if self.pending() != 0 {
            return None;
        }
        Arc::get_mut(self.scratch.as_mut()?).map(|s| s.buffer.as_mut_slice())
    }

    pub(crate) fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            src: self.src,
            dst: self.dst,
            len: self.len,
            kind: self.kind,
            callback: self.callback.clone(),
            scratch: self.scratch.clone(),
            pending: self.pending.clone(),
        }
    }
}
