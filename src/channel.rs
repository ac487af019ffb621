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

//! DMA channels.
//!
//! A [`DmaHandle`] wraps an accelerator and knows where its DMA channels are. A
//! [`DmaChannel`] owns one of them exclusively: it turns transfers into descriptors,
//! moves unaligned edges through the register window, stages host data through its
//! bounce ring and retires completions as the hardware reports them.
//!
//! Every wait is a poll loop paced by the channel's [`CompletionStrategy`], so every
//! wait ends, either in success or in [`DmaError::Timeout`].
//!
//! # Examples
//!
//! ```rust,no_run
//! # use fpga_dma::buffer::AlignedBuffer;
//! # use fpga_dma::channel::DmaHandle;
//! # use fpga_dma::sim::SimAccelerator;
//! # use fpga_dma::transfer::TransferType;
//! # use std::sync::Arc;
//! # fn example() -> Result<(), fpga_dma::error::DmaError> {
//! let handle = DmaHandle::open(Arc::new(SimAccelerator::new(1)))?;
//! let mut channel = handle.open_channel(0)?;
//! let buf = AlignedBuffer::allocate(4096)?;
//! let mut transfer = channel.init_transfer();
//! transfer
//!     .set_src(buf.addr())
//!     .set_dst(0)
//!     .set_len(4096)
//!     .set_type(TransferType::HostToFpga);
//! channel.start_transfer(&transfer)?;
//! channel.destroy_transfer(transfer).map_err(|(_, e)| e)?;
//! channel.close().map_err(|(_, e)| e)?;
//! # Ok(())
//! # }
//! ```

use crate::buffer::{AlignedBuffer, DmaRegion, resolve_host};
use crate::completion::{Completion, CompletionStrategy, Retire, RetireQueue};
use crate::config::{
    ALIGN_BYTES, BURST_BYTES, ChannelConfig, EngineConfig, HOST_MASK, engine_config,
};
use crate::error::{DmaError, FpgaResult};
use crate::mmio::Accelerator;
use crate::plan::{
    BurstSpan, Piece, check_overlap, chunks, is_line_aligned, split_bursts, split_device_range,
};
use crate::regs::{
    ChannelReg, ControlFlags, Descriptor, DescriptorControl, StatusFlags, WINDOW_SIZE,
    discover_channels,
};
use crate::transfer::{ScratchBuffer, Transfer, TransferOutcome, TransferSnapshot, TransferType};
use log::{debug, error, info, trace, warn};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// Channels currently open, keyed by accelerator identity and channel index.
static OPEN_CHANNELS: OnceLock<Mutex<HashSet<(usize, usize)>>> = OnceLock::new();
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

fn open_channels() -> Result<MutexGuard<'static, HashSet<(usize, usize)>>, DmaError> {
    OPEN_CHANNELS
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .map_err(|e| DmaError::Internal(format!("Failed when locking channel registry: {e}")))
}

fn accelerator_key(accel: &Arc<dyn Accelerator>) -> usize {
    Arc::as_ptr(accel) as *const () as usize
}

/// An accelerator and the DMA channels found on it.
pub struct DmaHandle {
    accel: Arc<dyn Accelerator>,
    channels: Vec<u64>,
}

impl DmaHandle {
    /// Discover the DMA channels of `accel`.
    ///
    /// # Returns: `Result<DmaHandle, DmaError>`
    /// * `Ok(DmaHandle)` - Handle, possibly with no channels
    /// * `Err(DmaError)` - Reading the feature list failed
    pub fn open(accel: Arc<dyn Accelerator>) -> Result<Self, DmaError> {
        let channels = discover_channels(accel.as_ref())?;
        info!("{} exposes {} DMA channel(s)", accel.name(), channels.len());
        Ok(DmaHandle { accel, channels })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Register offsets of the channels, in index order.
    pub fn channel_bases(&self) -> &[u64] {
        &self.channels
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accel
    }

    /// Open channel `index` with the process-wide configuration.
    pub fn open_channel(&self, index: usize) -> Result<DmaChannel, DmaError> {
        self.open_channel_with(index, engine_config()?)
    }

    /// Open channel `index` and reset its dispatcher.
    ///
    /// # Arguments
    ///
    /// * `index` - Channel index, in feature list order
    /// * `config` - Polling policy and resource limits for this channel
    ///
    /// # Returns: `Result<DmaChannel, DmaError>`
    /// * `Ok(DmaChannel)` - The channel, idle
    /// * `Err(DmaError::NoSuchChannel)` - `index` is not below [`DmaHandle::channel_count`]
    /// * `Err(DmaError::Busy)` - The channel is already open
    /// * `Err(DmaError::InvalidParam)` - `config` is unusable
    pub fn open_channel_with(
        &self,
        index: usize,
        config: EngineConfig,
    ) -> Result<DmaChannel, DmaError> {
        config.channel.validate()?;
        let base = *self
            .channels
            .get(index)
            .ok_or(DmaError::NoSuchChannel {
                index,
                available: self.channels.len(),
            })?;
        let key = (accelerator_key(&self.accel), index);
        if !open_channels()?.insert(key) {
            return Err(DmaError::Busy(format!(
                "channel {index} of {} is already open",
                self.accel.name()
            )));
        }
        let mut channel = DmaChannel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            index,
            key,
            accel: self.accel.clone(),
            base,
            config: config.channel,
            strategy: Box::new(config.polling),
            bounce: Vec::new(),
            next_slot: 0,
            staging: None,
            retire: RetireQueue::default(),
            issued: 0,
            completed: 0,
            in_flight: Arc::new(AtomicUsize::new(0)),
            small_live: Arc::new(AtomicUsize::new(0)),
            window_page: None,
        };
        channel.reset_dispatcher()?;
        info!("Opened DMA channel {index} at {base:#x}");
        Ok(channel)
    }
}

struct BounceSlot {
    buffer: AlignedBuffer,
    iova: u64,
    busy: bool,
}

/// Host side of a transfer: the memory, and its I/O address when it is DMA mapped.
struct HostSpan {
    region: DmaRegion,
    iova: Option<u64>,
}

impl HostSpan {
    /// I/O address for direct DMA at `offset`, when the memory is mapped and aligned.
    fn direct(&self, offset: u64) -> Option<u64> {
        self.iova
            .map(|iova| iova + offset)
            .filter(|_| is_line_aligned(self.region.addr() + offset))
    }

    fn part(&self, offset: u64, len: u64) -> Result<DmaRegion, DmaError> {
        self.region.subrange(offset as usize, len as usize)
    }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    /// I/O address of mapped host memory.
    Host(u64),
    Device(u64),
}

impl Endpoint {
    fn bus_address(self) -> u64 {
        match self {
            Endpoint::Host(iova) => iova | HOST_MASK,
            Endpoint::Device(addr) => addr,
        }
    }
}

enum Route {
    ToDevice(HostSpan),
    FromDevice(HostSpan),
    DeviceToDevice,
}

pub struct DmaChannel {
    id: u64,
    index: usize,
    key: (usize, usize),
    accel: Arc<dyn Accelerator>,
    base: u64,
    config: ChannelConfig,
    strategy: Box<dyn CompletionStrategy>,
    bounce: Vec<BounceSlot>,
    next_slot: usize,
    staging: Option<AlignedBuffer>,
    retire: RetireQueue,
    /// Ticket of the last descriptor queued.
    issued: u64,
    /// Ticket of the last descriptor the hardware reported complete.
    completed: u64,
    in_flight: Arc<AtomicUsize>,
    small_live: Arc<AtomicUsize>,
    window_page: Option<u64>,
}

impl DmaChannel {
    pub fn index(&self) -> usize {
        self.index
    }

    /// A transfer using caller-provided buffers.
    pub fn init_transfer(&self) -> Transfer {
        Transfer::new(self.id, None)
    }

    /// A transfer that owns a DMA-mapped scratch buffer of at least `size` bytes.
    ///
    /// Fill it through [`Transfer::scratch_mut`] or [`Transfer::scratch_addr`]; host
    /// ranges inside it are transferred without staging when line aligned.
    ///
    /// # Returns: `Result<Transfer, DmaError>`
    /// * `Ok(Transfer)` - Transfer bound to this channel
    /// * `Err(DmaError::InvalidParam)` - `size` is zero or above the configured maximum
    /// * `Err(DmaError::NoMemory)` - The channel already has the maximum number of scratch buffers
    pub fn init_small_transfer(&mut self, size: usize) -> Result<Transfer, DmaError> {
        if size == 0 || size > self.config.small_buffer_max_size {
            return Err(DmaError::InvalidParam(format!(
                "scratch size {size:#x} must be between 1 and {:#x}",
                self.config.small_buffer_max_size
            )));
        }
        let live = self.small_live.load(Ordering::Acquire);
        if live >= self.config.max_small_buffers {
            return Err(DmaError::NoMemory(format!(
                "channel {} already has {live} scratch buffers",
                self.index
            )));
        }
        let buffer = AlignedBuffer::allocate(size)?;
        let scratch = ScratchBuffer::new(buffer, self.accel.clone(), self.small_live.clone())?;
        debug!("Channel {}: new small transfer with {size:#x} scratch bytes", self.index);
        Ok(Transfer::new(self.id, Some(scratch)))
    }

    /// Start a transfer.
    ///
    /// The transfer's parameters are copied, so it may be changed and started again right
    /// away. Without a callback the call returns once the data has moved. With a callback
    /// it returns as soon as everything is queued; a later [`DmaChannel::poll`] runs the
    /// callback.
    ///
    /// # Returns: `Result<(), DmaError>`
    /// * `Ok(())` - Completed (synchronous) or queued (asynchronous)
    /// * `Err(DmaError::InvalidParam)` - Bad parameters; nothing was written to the device
    /// * `Err(DmaError::NotSupported)` - Overlapping device-to-device copy
    /// * `Err(DmaError::Exception)` - The dispatcher stopped on error
    /// * `Err(DmaError::Timeout)` - The polling budget ran out
    pub fn start_transfer(&mut self, transfer: &Transfer) -> Result<(), DmaError> {
        let snap = transfer.snapshot();
        let route = self.validate(transfer.channel, &snap)?;
        self.make_room()?;
        debug!(
            "Channel {}: {:?} {:#x} -> {:#x}, {} bytes{}",
            self.index,
            snap.kind,
            snap.src,
            snap.dst,
            snap.len,
            if snap.callback.is_some() { " (async)" } else { "" }
        );

        let mut completion = Completion::new(
            snap.pending.clone(),
            self.in_flight.clone(),
            snap.callback.clone(),
            snap.scratch.clone(),
        );
        let queued = match &route {
            Route::ToDevice(host) => self.issue_to_device(host, snap.dst, snap.len),
            Route::FromDevice(host) => self.issue_from_device(host, snap.src, snap.len),
            Route::DeviceToDevice => self.issue_device_copy(snap.src, snap.dst, snap.len),
        };
        match queued {
            Ok(()) => self.retire.push(self.issued, Retire::Finish(completion)),
            Err(e @ DmaError::Exception { .. }) => {
                completion.finish(Some(TransferOutcome::Failed(FpgaResult::Exception)));
                return Err(e);
            }
            Err(e) => {
                completion.fail(TransferOutcome::Failed(e.code()));
                self.retire.push(self.issued, Retire::Finish(completion));
                if let Err(retire) = self.retire_ready() {
                    warn!("channel {}: retiring after a failed submission: {retire}", self.index);
                }
                return Err(e);
            }
        }

        if snap.callback.is_none() {
            let pending = snap.pending;
            self.spin("transfer completion", |ch| {
                ch.refresh()?;
                Ok(pending.load(Ordering::Acquire) == 0)
            })?;
        }
        Ok(())
    }

    /// Release a transfer. Hands it back with [`DmaError::Busy`] while a start of it is
    /// still in flight.
    pub fn destroy_transfer(&mut self, transfer: Transfer) -> Result<(), (Transfer, DmaError)> {
        if transfer.channel != self.id {
            return Err((
                transfer,
                DmaError::InvalidParam(format!(
                    "transfer does not belong to channel {}",
                    self.index
                )),
            ));
        }
        if let Err(e) = self.retire_ready() {
            return Err((transfer, e));
        }
        let pending = transfer.pending();
        if pending > 0 {
            return Err((
                transfer,
                DmaError::Busy(format!("{pending} start(s) of the transfer still in flight")),
            ));
        }
        trace!("Channel {}: destroyed {transfer:?}", self.index);
        Ok(())
    }

    /// Retire whatever the hardware has finished and run the callbacks that are due.
    ///
    /// # Returns: `Result<usize, DmaError>`
    /// * `Ok(usize)` - Transfers finished by this call
    /// * `Err(DmaError::Exception)` - The dispatcher stopped on error; pending transfers were failed
    pub fn poll(&mut self) -> Result<usize, DmaError> {
        self.refresh().map(|(_, finished)| finished)
    }

    /// Poll until at most `target` transfers are in flight.
    pub fn wait_for_count(&mut self, target: usize, timeout: Duration) -> Result<(), DmaError> {
        let deadline = Instant::now() + timeout;
        self.spin("in-flight transfers to drain", |ch| {
            ch.refresh()?;
            let in_flight = ch.in_flight();
            if in_flight <= target {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Err(DmaError::Timeout(format!(
                    "{in_flight} transfer(s) still in flight on channel {} after {timeout:?}",
                    ch.index
                )));
            }
            Ok(false)
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The in-flight counter, for observers on other threads.
    pub fn in_flight_counter(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    pub fn status(&self) -> Result<StatusFlags, DmaError> {
        Ok(StatusFlags::from_bits_retain(self.read32(ChannelReg::Status)?))
    }

    /// Fail every pending transfer and reset the dispatcher.
    pub fn reset(&mut self) -> Result<(), DmaError> {
        info!("Resetting DMA channel {}", self.index);
        self.fail_all(TransferOutcome::Failed(FpgaResult::Exception));
        self.reset_dispatcher()
    }

    pub fn set_completion_strategy(&mut self, strategy: Box<dyn CompletionStrategy>) {
        self.strategy = strategy;
    }

    /// Close the channel. Hands it back with [`DmaError::Busy`] while transfers are in
    /// flight.
    pub fn close(mut self) -> Result<(), (Self, DmaError)> {
        if let Err(e) = self.refresh() {
            warn!("{e}");
        }
        let in_flight = self.in_flight();
        if in_flight > 0 {
            let err = DmaError::Busy(format!(
                "{in_flight} transfer(s) still in flight on channel {}",
                self.index
            ));
            return Err((self, err));
        }
        Ok(())
    }

    fn validate(&self, channel: u64, snap: &TransferSnapshot) -> Result<Route, DmaError> {
        if channel != self.id {
            return Err(DmaError::InvalidParam(format!(
                "transfer does not belong to channel {}",
                self.index
            )));
        }
        if snap.len == 0 {
            return Err(DmaError::InvalidParam(
                "transfer length must be non-zero".to_string(),
            ));
        }
        match snap.kind {
            TransferType::HostToFpga => {
                check_device_range(snap.dst, snap.len)?;
                Ok(Route::ToDevice(host_span(snap, snap.src)?))
            }
            TransferType::FpgaToHost => {
                check_device_range(snap.src, snap.len)?;
                Ok(Route::FromDevice(host_span(snap, snap.dst)?))
            }
            TransferType::FpgaToFpga => {
                check_device_range(snap.src, snap.len)?;
                check_device_range(snap.dst, snap.len)?;
                check_overlap(snap.src, snap.dst, snap.len)?;
                Ok(Route::DeviceToDevice)
            }
        }
    }

    fn make_room(&mut self) -> Result<(), DmaError> {
        let limit = self.config.max_in_flight;
        if self.in_flight() < limit {
            return Ok(());
        }
        self.spin("a free queue entry", |ch| {
            ch.refresh()?;
            Ok(ch.in_flight() < limit)
        })
    }

    fn issue_to_device(&mut self, host: &HostSpan, dev: u64, len: u64) -> Result<(), DmaError> {
        // Earlier device-to-host transfers land in host memory only when retired.
        if self.retire.has_copy_out() {
            self.drain()?;
            self.retire_ready()?;
        }
        for piece in split_device_range(dev, len) {
            match piece {
                Piece::Window { offset, len } => {
                    let mut bytes = vec![0u8; len as usize];
                    self.drain()?;
                    host.part(offset, len)?.read(&mut bytes)?;
                    self.window_write(dev + offset, &bytes)?;
                }
                Piece::Dma { offset, len } => match host.direct(offset) {
                    Some(iova) => {
                        for (at, n) in chunks(len, self.chunk_size()) {
                            self.push_copy(
                                Endpoint::Host(iova + at),
                                Endpoint::Device(dev + offset + at),
                                n,
                            )?;
                        }
                    }
                    None => {
                        for (at, n) in chunks(len, self.chunk_size()) {
                            let slot = self.acquire_slot()?;
                            let iova = self.bounce[slot].iova;
                            let staged = host
                                .part(offset + at, n)
                                .and_then(|src| self.bounce[slot].buffer.region().copy_from(&src));
                            let queued = staged.and_then(|()| {
                                self.push_copy(
                                    Endpoint::Host(iova),
                                    Endpoint::Device(dev + offset + at),
                                    n,
                                )
                            });
                            self.retire.push(self.issued, Retire::FreeSlot(slot));
                            queued?;
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn issue_from_device(&mut self, host: &HostSpan, dev: u64, len: u64) -> Result<(), DmaError> {
        for piece in split_device_range(dev, len) {
            match piece {
                Piece::Window { offset, len } => {
                    let mut bytes = vec![0u8; len as usize];
                    self.drain()?;
                    self.window_read(dev + offset, &mut bytes)?;
                    host.part(offset, len)?.write(&bytes)?;
                }
                Piece::Dma { offset, len } => match host.direct(offset) {
                    Some(iova) => {
                        for (at, n) in chunks(len, self.chunk_size()) {
                            self.push_copy(
                                Endpoint::Device(dev + offset + at),
                                Endpoint::Host(iova + at),
                                n,
                            )?;
                        }
                    }
                    None => {
                        for (at, n) in chunks(len, self.chunk_size()) {
                            let slot = self.acquire_slot()?;
                            let iova = self.bounce[slot].iova;
                            let dst = host.part(offset + at, n);
                            let queued = dst.and_then(|dst| {
                                self.push_copy(
                                    Endpoint::Device(dev + offset + at),
                                    Endpoint::Host(iova),
                                    n,
                                )
                                .map(|()| dst)
                            });
                            match queued {
                                Ok(dst) => {
                                    self.retire.push(self.issued, Retire::CopyOut { slot, dst })
                                }
                                Err(e) => {
                                    self.retire.push(self.issued, Retire::FreeSlot(slot));
                                    return Err(e);
                                }
                            }
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn issue_device_copy(&mut self, src: u64, dst: u64, len: u64) -> Result<(), DmaError> {
        if is_line_aligned(src) && is_line_aligned(dst) && is_line_aligned(len) {
            for (at, n) in chunks(len, self.chunk_size()) {
                self.push_copy(Endpoint::Device(src + at), Endpoint::Device(dst + at), n)?;
            }
            return Ok(());
        }
        trace!("Channel {}: staging unaligned device copy through host memory", self.index);
        let staging = self.staging()?;
        for (at, n) in chunks(len, self.chunk_size()) {
            let part = HostSpan {
                region: staging.subrange(0, n as usize)?,
                iova: None,
            };
            self.issue_from_device(&part, src + at, n)?;
            self.drain()?;
            self.issue_to_device(&part, dst + at, n)?;
        }
        Ok(())
    }

    /// Queue descriptors copying `len` line-aligned bytes from `src` to `dst`.
    fn push_copy(&mut self, src: Endpoint, dst: Endpoint, len: u64) -> Result<(), DmaError> {
        let spans = match (src, dst) {
            (Endpoint::Host(iova), _) | (_, Endpoint::Host(iova)) => split_bursts(iova, len),
            _ => vec![BurstSpan {
                offset: 0,
                len,
                burst: (BURST_BYTES / ALIGN_BYTES) as u8,
            }],
        };
        let last = spans.len().saturating_sub(1);
        for (i, span) in spans.iter().enumerate() {
            let control = if i == last {
                DescriptorControl::GO
                    | DescriptorControl::TRANSFER_IRQ_EN
                    | DescriptorControl::WAIT_FOR_WR_RSP
            } else {
                DescriptorControl::GO | DescriptorControl::EARLY_DONE_EN
            };
            let ticket = self.issued + 1;
            let desc = Descriptor {
                rd_address: src.bus_address() + span.offset,
                wr_address: dst.bus_address() + span.offset,
                len: span.len as u32,
                seq_num: ticket as u16,
                rd_burst: span.burst,
                wr_burst: span.burst,
                control,
            };
            self.submit(&desc)?;
            self.issued = ticket;
        }
        Ok(())
    }

    fn submit(&mut self, desc: &Descriptor) -> Result<(), DmaError> {
        self.spin("descriptor FIFO space", |ch| {
            let (status, _) = ch.refresh()?;
            Ok(!status.contains(StatusFlags::DESC_BUF_FULL))
        })?;
        trace!("Channel {}: queueing {desc:x?}", self.index);
        for (i, word) in desc.to_words().into_iter().enumerate() {
            self.accel
                .write_mmio32(self.base + ChannelReg::Descriptor + 4 * i as u64, word)?;
        }
        Ok(())
    }

    /// Read status and completion progress, then retire what completed.
    fn refresh(&mut self) -> Result<(StatusFlags, usize), DmaError> {
        let status = self.status()?;
        if status.contains(StatusFlags::STOPPED_ON_ERROR) {
            return Err(self.hardware_error(status));
        }
        let hw = (self.read32(ChannelReg::SeqNum)? >> 16) as u16;
        let delta = hw.wrapping_sub(self.completed as u16) as u64;
        if delta > self.issued - self.completed {
            return Err(DmaError::Internal(format!(
                "channel {} reports sequence {hw:#x} but only {} descriptor(s) are outstanding",
                self.index,
                self.issued - self.completed
            )));
        }
        self.completed += delta;
        Ok((status, self.retire_ready()?))
    }

    fn retire_ready(&mut self) -> Result<usize, DmaError> {
        let mut finished = 0;
        while let Some(action) = self.retire.pop_done(self.completed) {
            match action {
                Retire::FreeSlot(slot) => self.release_slot(slot),
                Retire::CopyOut { slot, dst } => {
                    let copied = self.bounce[slot]
                        .buffer
                        .region()
                        .subrange(0, dst.len())
                        .and_then(|src| dst.copy_from(&src));
                    self.release_slot(slot);
                    copied?;
                }
                Retire::Finish(completion) => {
                    completion.finish(None);
                    finished += 1;
                }
            }
        }
        Ok(finished)
    }

    fn hardware_error(&mut self, status: StatusFlags) -> DmaError {
        error!(
            "DMA channel {} stopped on error, status {status:?}",
            self.index
        );
        self.fail_all(TransferOutcome::Failed(FpgaResult::Exception));
        if let Err(e) = self.reset_dispatcher() {
            error!("Failed to reset DMA channel {} after an error: {e}", self.index);
        }
        DmaError::Exception {
            channel: self.index,
            status: status.bits(),
        }
    }

    fn fail_all(&mut self, outcome: TransferOutcome) {
        let actions: Vec<Retire> = self.retire.drain().collect();
        for action in actions {
            match action {
                Retire::FreeSlot(slot) | Retire::CopyOut { slot, .. } => self.release_slot(slot),
                Retire::Finish(completion) => completion.finish(Some(outcome)),
            }
        }
    }

    fn reset_dispatcher(&mut self) -> Result<(), DmaError> {
        self.write32(ChannelReg::Control, ControlFlags::RESET_DISPATCHER.bits())?;
        self.spin("dispatcher reset", |ch| {
            Ok(!ch.status()?.contains(StatusFlags::RESETTING))
        })?;
        self.write32(ChannelReg::Control, ControlFlags::STOP_ON_ERROR.bits())?;
        self.issued = 0;
        self.completed = 0;
        self.window_page = None;
        debug!("Channel {}: dispatcher reset", self.index);
        Ok(())
    }

    /// Wait until every queued descriptor has completed.
    fn drain(&mut self) -> Result<(), DmaError> {
        if self.issued == self.completed {
            return Ok(());
        }
        self.spin("outstanding descriptors", |ch| {
            ch.refresh()?;
            Ok(ch.completed == ch.issued)
        })
    }

    fn spin<F>(&mut self, what: &str, mut done: F) -> Result<(), DmaError>
    where
        F: FnMut(&mut Self) -> Result<bool, DmaError>,
    {
        let mut attempt = 0u64;
        loop {
            if done(self)? {
                return Ok(());
            }
            if !self.strategy.pause(attempt) {
                return Err(DmaError::Timeout(format!(
                    "gave up waiting for {what} on channel {} after {attempt} polls",
                    self.index
                )));
            }
            attempt += 1;
        }
    }

    fn chunk_size(&self) -> u64 {
        self.config.bounce_buffer_size as u64
    }

    fn ensure_bounce(&mut self) -> Result<(), DmaError> {
        if !self.bounce.is_empty() {
            return Ok(());
        }
        for _ in 0..self.config.bounce_buffers {
            let buffer = AlignedBuffer::allocate(self.config.bounce_buffer_size)?;
            let iova = self.accel.map_dma(&buffer.region())?;
            self.bounce.push(BounceSlot {
                buffer,
                iova,
                busy: false,
            });
        }
        debug!(
            "Channel {}: mapped {} bounce buffers of {:#x} bytes",
            self.index, self.config.bounce_buffers, self.config.bounce_buffer_size
        );
        Ok(())
    }

    fn acquire_slot(&mut self) -> Result<usize, DmaError> {
        self.ensure_bounce()?;
        let slot = self.next_slot;
        self.next_slot = (slot + 1) % self.bounce.len();
        if self.bounce[slot].busy {
            self.spin("a bounce buffer", |ch| {
                ch.refresh()?;
                Ok(!ch.bounce[slot].busy)
            })?;
        }
        self.bounce[slot].busy = true;
        Ok(slot)
    }

    fn release_slot(&mut self, slot: usize) {
        if let Some(s) = self.bounce.get_mut(slot) {
            s.busy = false;
        }
    }

    fn staging(&mut self) -> Result<DmaRegion, DmaError> {
        let buffer = match self.staging.take() {
            Some(buffer) => buffer,
            None => AlignedBuffer::allocate(self.config.bounce_buffer_size)?,
        };
        let region = buffer.region();
        self.staging = Some(buffer);
        Ok(region)
    }

    fn read32(&self, reg: ChannelReg) -> Result<u32, DmaError> {
        self.accel.read_mmio32(self.base + reg)
    }

    fn write32(&self, reg: ChannelReg, value: u32) -> Result<(), DmaError> {
        trace!("Channel {}: {reg:?} <- {value:#x}", self.index);
        self.accel.write_mmio32(self.base + reg, value)
    }

    /// Point the address-span window at the page holding `addr`; return the register
    /// offset of `addr` inside it.
    fn window_at(&mut self, addr: u64) -> Result<u64, DmaError> {
        let page = addr & !(WINDOW_SIZE - 1);
        if self.window_page != Some(page) {
            self.accel
                .write_mmio64(self.base + ChannelReg::SpanPage, page)?;
            self.window_page = Some(page);
        }
        Ok(self.base + ChannelReg::SpanData + (addr - page))
    }

    fn window_read64(&mut self, addr: u64) -> Result<u64, DmaError> {
        let reg = self.window_at(addr)?;
        self.accel.read_mmio64(reg)
    }

    fn window_write64(&mut self, addr: u64, value: u64) -> Result<(), DmaError> {
        let reg = self.window_at(addr)?;
        self.accel.write_mmio64(reg, value)
    }

    fn window_write32(&mut self, addr: u64, value: u32) -> Result<(), DmaError> {
        let reg = self.window_at(addr)?;
        self.accel.write_mmio32(reg, value)
    }

    fn window_read(&mut self, dev: u64, out: &mut [u8]) -> Result<(), DmaError> {
        let mut done = 0;
        while done < out.len() {
            let addr = dev + done as u64;
            let qword = addr & !7;
            let shift = (addr - qword) as usize;
            let n = (8 - shift).min(out.len() - done);
            let bytes = self.window_read64(qword)?.to_le_bytes();
            out[done..done + n].copy_from_slice(&bytes[shift..shift + n]);
            done += n;
        }
        Ok(())
    }

    /// Write bytes through the window: read-modify-write up to a word boundary, then
    /// whole words.
    fn window_write(&mut self, dev: u64, data: &[u8]) -> Result<(), DmaError> {
        let mut done = 0;
        while done < data.len() {
            let addr = dev + done as u64;
            let rest = &data[done..];
            if addr % 8 == 0 && rest.len() >= 8 {
                let mut word = [0u8; 8];
                word.copy_from_slice(&rest[..8]);
                self.window_write64(addr, u64::from_le_bytes(word))?;
                done += 8;
            } else if addr % 4 == 0 && rest.len() >= 4 {
                let mut word = [0u8; 4];
                word.copy_from_slice(&rest[..4]);
                self.window_write32(addr, u32::from_le_bytes(word))?;
                done += 4;
            } else {
                let qword = addr & !7;
                let shift = (addr - qword) as usize;
                let n = (8 - shift).min(rest.len());
                let mut bytes = self.window_read64(qword)?.to_le_bytes();
                bytes[shift..shift + n].copy_from_slice(&rest[..n]);
                self.window_write64(qword, u64::from_le_bytes(bytes))?;
                done += n;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DmaChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaChannel")
            .field("index", &self.index)
            .field("base", &format_args!("{:#x}", self.base))
            .field("issued", &self.issued)
            .field("completed", &self.completed)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Drop for DmaChannel {
    fn drop(&mut self) {
        let in_flight = self.in_flight();
        if in_flight > 0 || !self.retire.is_empty() {
            warn!(
                "DMA channel {} dropped with {in_flight} transfer(s) in flight, resetting",
                self.index
            );
            self.fail_all(TransferOutcome::Failed(FpgaResult::Exception));
            if let Err(e) = self.reset_dispatcher() {
                warn!("{e}");
            }
        }
        for slot in self.bounce.drain(..) {
            if let Err(e) = self.accel.unmap_dma(slot.iova) {
                warn!("Failed to unmap bounce buffer {:?}: {e}", slot.buffer.id());
            }
        }
        match open_channels() {
            Ok(mut open) => {
                open.remove(&self.key);
            }
            Err(e) => warn!("{e}"),
        }
        info!("Closed DMA channel {}", self.index);
    }
}

fn check_device_range(addr: u64, len: u64) -> Result<(), DmaError> {
    match addr.checked_add(len) {
        Some(end) if end <= HOST_MASK => Ok(()),
        _ => Err(DmaError::InvalidParam(format!(
            "device range {addr:#x}+{len:#x} is not addressable"
        ))),
    }
}

fn host_span(snap: &TransferSnapshot, addr: u64) -> Result<HostSpan, DmaError> {
    if let Some(scratch) = &snap.scratch {
        let region = scratch.region();
        if region.contains(addr, snap.len) {
            return Ok(HostSpan {
                region: region.subrange((addr - region.addr()) as usize, snap.len as usize)?,
                iova: Some(scratch.iova_of(addr)),
            });
        }
    }
    Ok(HostSpan {
        region: resolve_host(addr, snap.len)?,
        iova: None,
    })
}
