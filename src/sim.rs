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

//! An in-process accelerator model.
//!
//! `SimAccelerator` exposes the same register contract as the hardware: a feature list
//! with one M2M DMA feature per channel, the dispatcher CSR, the descriptor FIFO, and the
//! address-span window onto a sparse device memory. Descriptors queue on the final
//! descriptor word and execute when the status register is read, a bounded number per
//! read, so the engine observes FIFO backpressure and out-of-band completion the way it
//! does on hardware. Host memory is reached through the I/O addresses handed out by
//! [`Accelerator::map_dma`].
//!
//! Faults can be injected: a stalled model never completes anything, and `fail_after`
//! makes the dispatcher stop on error after a number of descriptors.

use crate::buffer::{DmaRegion, page_size, round_up};
use crate::config::HOST_MASK;
use crate::error::DmaError;
use crate::mmio::Accelerator;
use crate::regs::{
    ChannelReg, ControlFlags, DESCRIPTOR_WORDS, DFH_TYPE_AFU, DFH_TYPE_BBB, Descriptor,
    DescriptorControl, Dfh, M2M_DMA_UUID_H, M2M_DMA_UUID_L, StatusFlags, WINDOW_SIZE,
};
use log::{debug, trace, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Distance between feature headers in the model's register space.
pub const SIM_FEATURE_STRIDE: u64 = 0x2000;
const SIM_DMA_FEATURE_ID: u16 = 0x765;
const SIM_AFU_GUID_L: u64 = 0x9f0c_4e2d_5bb1_7a30;
const SIM_AFU_GUID_H: u64 = 0x331d_b30c_9885_41ea;
const SIM_PAGE: u64 = 64 * 1024;
const IOVA_BASE: u64 = 0x1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    pub channels: usize,
    /// Descriptors the FIFO holds before reporting full.
    pub fifo_depth: usize,
    /// Descriptors executed per status register read.
    pub descriptors_per_poll: usize,
    pub device_memory: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            channels: 1,
            fifo_depth: 128,
            descriptors_per_poll: 16,
            device_memory: 8 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Default)]
struct SimChannel {
    fifo: VecDeque<Descriptor>,
    staged: [u32; DESCRIPTOR_WORDS],
    control: u32,
    seq: u16,
    error: bool,
    page: u64,
    executed: u64,
}

impl SimChannel {
    fn status(&self, depth: usize) -> StatusFlags {
        let mut status = StatusFlags::RSP_BUF_EMPTY;
        if self.fifo.is_empty() {
            status |= StatusFlags::DESC_BUF_EMPTY;
        } else {
            status |= StatusFlags::BUSY;
        }
        if self.fifo.len() >= depth {
            status |= StatusFlags::DESC_BUF_FULL;
        }
        if self.error {
            status |= StatusFlags::STOPPED | StatusFlags::STOPPED_ON_ERROR;
        }
        status
    }

    fn reset(&mut self) {
        self.fifo.clear();
        self.staged = [0; DESCRIPTOR_WORDS];
        self.seq = 0;
        self.error = false;
    }
}

struct DeviceMemory {
    size: u64,
    pages: HashMap<u64, Box<[u8]>>,
}

impl DeviceMemory {
    fn check(&self, addr: u64, len: usize) -> Result<(), DmaError> {
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DmaError::InvalidParam(format!(
                "device range {addr:#x}+{len:#x} is outside {:#x} bytes of device memory",
                self.size
            ))),
        }
    }

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), DmaError> {
        self.check(addr, out.len())?;
        let mut done = 0;
        while done < out.len() {
            let at = addr + done as u64;
            let (page, offset) = (at / SIM_PAGE, (at % SIM_PAGE) as usize);
            let n = (SIM_PAGE as usize - offset).min(out.len() - done);
            match self.pages.get(&page) {
                Some(bytes) => out[done..done + n].copy_from_slice(&bytes[offset..offset + n]),
                None => out[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        self.check(addr, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u64;
            let (page, offset) = (at / SIM_PAGE, (at % SIM_PAGE) as usize);
            let n = (SIM_PAGE as usize - offset).min(data.len() - done);
            let bytes = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; SIM_PAGE as usize].into_boxed_slice());
            bytes[offset..offset + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }
}

struct SimState {
    config: SimConfig,
    channels: Vec<SimChannel>,
    memory: DeviceMemory,
    iova: BTreeMap<u64, DmaRegion>,
    next_iova: u64,
    stalled: bool,
    fail_after: Option<u64>,
}

enum Target {
    Afu(u64),
    Channel(usize, u64),
}

impl SimState {
    fn locate(&self, offset: u64) -> Result<Target, DmaError> {
        let slot = offset / SIM_FEATURE_STRIDE;
        let rel = offset % SIM_FEATURE_STRIDE;
        match slot {
            0 => Ok(Target::Afu(rel)),
            n if (n as usize) <= self.channels.len() => Ok(Target::Channel(n as usize - 1, rel)),
            _ => Err(DmaError::InvalidParam(format!(
                "register offset {offset:#x} is outside the model's register space"
            ))),
        }
    }

    fn header(&self, target: &Target) -> Option<u64> {
        let count = self.channels.len();
        match *target {
            Target::Afu(0) => Some(Dfh::new(DFH_TYPE_AFU, SIM_FEATURE_STRIDE, count == 0, 0).0),
            Target::Afu(0x8) => Some(SIM_AFU_GUID_L),
            Target::Afu(0x10) => Some(SIM_AFU_GUID_H),
            Target::Channel(c, 0) => Some(
                Dfh::new(
                    DFH_TYPE_BBB,
                    SIM_FEATURE_STRIDE,
                    c + 1 == count,
                    SIM_DMA_FEATURE_ID,
                )
                .0,
            ),
            Target::Channel(_, 0x8) => Some(M2M_DMA_UUID_L),
            Target::Channel(_, 0x10) => Some(M2M_DMA_UUID_H),
            _ => None,
        }
    }

    fn window(&self, c: usize, rel: u64, len: u64) -> Option<u64> {
        let start = ChannelReg::SpanData as u64;
        if rel >= start && rel + len <= start + WINDOW_SIZE {
            Some(self.channels[c].page + rel - start)
        } else {
            None
        }
    }

    fn read64(&mut self, offset: u64) -> Result<u64, DmaError> {
        check_aligned(offset, 8)?;
        let target = self.locate(offset)?;
        if let Some(value) = self.header(&target) {
            return Ok(value);
        }
        if let Target::Channel(c, rel) = target {
            if rel == ChannelReg::SpanPage as u64 {
                return Ok(self.channels[c].page);
            }
            if let Some(addr) = self.window(c, rel, 8) {
                let mut bytes = [0u8; 8];
                self.memory.read(addr, &mut bytes)?;
                return Ok(u64::from_le_bytes(bytes));
            }
        }
        let lo = self.read32(offset)? as u64;
        let hi = self.read32(offset + 4)? as u64;
        Ok(hi << 32 | lo)
    }

    fn read32(&mut self, offset: u64) -> Result<u32, DmaError> {
        check_aligned(offset, 4)?;
        let target = self.locate(offset)?;
        if let Some(value) = self.header(&Target::from_aligned(&target)) {
            return Ok(if offset % 8 == 0 {
                value as u32
            } else {
                (value >> 32) as u32
            });
        }
        let Target::Channel(c, rel) = target else {
            return Ok(0);
        };
        if let Some(addr) = self.window(c, rel, 4) {
            let mut bytes = [0u8; 4];
            self.memory.read(addr, &mut bytes)?;
            return Ok(u32::from_le_bytes(bytes));
        }
        let descriptor = ChannelReg::Descriptor as u64;
        let value = match rel {
            r if r == ChannelReg::Status as u64 => {
                self.process(c);
                self.channels[c].status(self.config.fifo_depth).bits()
            }
            r if r == ChannelReg::Control as u64 => self.channels[c].control,
            r if r == ChannelReg::FillLevel as u64 => {
                let fill = self.channels[c].fifo.len() as u32 & 0xffff;
                fill << 16 | fill
            }
            r if r == ChannelReg::SeqNum as u64 => {
                let seq = self.channels[c].seq as u32;
                seq << 16 | seq
            }
            r if (descriptor..descriptor + 4 * DESCRIPTOR_WORDS as u64).contains(&r) => {
                self.channels[c].staged[((r - descriptor) / 4) as usize]
            }
            _ => 0,
        };
        Ok(value)
    }

    fn write64(&mut self, offset: u64, value: u64) -> Result<(), DmaError> {
        check_aligned(offset, 8)?;
        if let Target::Channel(c, rel) = self.locate(offset)? {
            if rel == ChannelReg::SpanPage as u64 {
                self.channels[c].page = value & !(WINDOW_SIZE - 1);
                trace!("sim: channel {c} window at {:#x}", self.channels[c].page);
                return Ok(());
            }
            if let Some(addr) = self.window(c, rel, 8) {
                return self.memory.write(addr, &value.to_le_bytes());
            }
        }
        self.write32(offset, value as u32)?;
        self.write32(offset + 4, (value >> 32) as u32)
    }

    fn write32(&mut self, offset: u64, value: u32) -> Result<(), DmaError> {
        check_aligned(offset, 4)?;
        let target = self.locate(offset)?;
        if self.header(&Target::from_aligned(&target)).is_some() {
            return Err(DmaError::InvalidParam(format!(
                "register {offset:#x} is read-only"
            )));
        }
        let Target::Channel(c, rel) = target else {
            return Ok(());
        };
        if let Some(addr) = self.window(c, rel, 4) {
            return self.memory.write(addr, &value.to_le_bytes());
        }
        let descriptor = ChannelReg::Descriptor as u64;
        match rel {
            r if r == ChannelReg::Control as u64 => {
                let control = ControlFlags::from_bits_retain(value);
                if control.contains(ControlFlags::RESET_DISPATCHER) {
                    debug!("sim: resetting dispatcher of channel {c}");
                    self.channels[c].reset();
                }
                self.channels[c].control = (control - ControlFlags::RESET_DISPATCHER).bits();
            }
            r if (descriptor..descriptor + 4 * DESCRIPTOR_WORDS as u64).contains(&r) => {
                let word = ((r - descriptor) / 4) as usize;
                self.channels[c].staged[word] = value;
                if word == DESCRIPTOR_WORDS - 1
                    && DescriptorControl::from_bits_retain(value).contains(DescriptorControl::GO)
                {
                    self.enqueue(c)?;
                }
            }
            _ => trace!("sim: ignoring write of {value:#x} to {offset:#x}"),
        }
        Ok(())
    }

    fn enqueue(&mut self, c: usize) -> Result<(), DmaError> {
        let depth = self.config.fifo_depth;
        let channel = &mut self.channels[c];
        if channel.fifo.len() >= depth {
            return Err(DmaError::Internal(format!(
                "descriptor FIFO overflow on channel {c}"
            )));
        }
        let desc = Descriptor::from_words(&channel.staged);
        trace!("sim: channel {c} queued {desc:x?}");
        channel.fifo.push_back(desc);
        Ok(())
    }

    fn process(&mut self, c: usize) {
        if self.stalled {
            return;
        }
        for _ in 0..self.config.descriptors_per_poll {
            if self.channels[c].error {
                return;
            }
            if self.fail_after == Some(0) {
                if !self.channels[c].fifo.is_empty() {
                    warn!("sim: injecting a dispatcher error on channel {c}");
                    self.fail_after = None;
                    self.channels[c].error = true;
                }
                return;
            }
            let Some(desc) = self.channels[c].fifo.pop_front() else {
                return;
            };
            if let Some(left) = self.fail_after.as_mut() {
                *left -= 1;
            }
            match self.execute(&desc) {
                Ok(()) => {
                    let channel = &mut self.channels[c];
                    channel.seq = desc.seq_num;
                    channel.executed += 1;
                }
                Err(e) => {
                    warn!("sim: descriptor {desc:x?} failed on channel {c}: {e}");
                    self.channels[c].error = true;
                }
            }
        }
    }

    fn execute(&mut self, desc: &Descriptor) -> Result<(), DmaError> {
        let mut data = vec![0u8; desc.len as usize];
        if desc.rd_address & HOST_MASK != 0 {
            self.host(desc.rd_address & !HOST_MASK, data.len())?
                .read(&mut data)?;
        } else {
            self.memory.read(desc.rd_address, &mut data)?;
        }
        if desc.wr_address & HOST_MASK != 0 {
            self.host(desc.wr_address & !HOST_MASK, data.len())?
                .write(&data)
        } else {
            self.memory.write(desc.wr_address, &data)
        }
    }

    fn host(&self, iova: u64, len: usize) -> Result<DmaRegion, DmaError> {
        match self.iova.range(..=iova).next_back() {
            Some((base, region)) => region.subrange((iova - base) as usize, len),
            None => Err(DmaError::InvalidParam(format!(
                "I/O address {iova:#x} is not mapped"
            ))),
        }
    }
}

impl Target {
    /// The 64-bit header register a 32-bit access falls into.
    fn from_aligned(target: &Target) -> Target {
        match *target {
            Target::Afu(rel) => Target::Afu(rel & !7),
            Target::Channel(c, rel) => Target::Channel(c, rel & !7),
        }
    }
}

fn check_aligned(offset: u64, size: u64) -> Result<(), DmaError> {
    if offset % size != 0 {
        return Err(DmaError::InvalidParam(format!(
            "unaligned {size}-byte register access at {offset:#x}"
        )));
    }
    Ok(())
}

pub struct SimAccelerator {
    state: Mutex<SimState>,
    mmio_writes: AtomicU64,
}

impl SimAccelerator {
    /// A model with `channels` DMA channels and default sizing.
    pub fn new(channels: usize) -> Self {
        Self::with_config(SimConfig {
            channels,
            ..SimConfig::default()
        })
    }

    pub fn with_config(config: SimConfig) -> Self {
        debug!("Creating simulated accelerator: {config:?}");
        SimAccelerator {
            state: Mutex::new(SimState {
                config,
                channels: (0..config.channels).map(|_| SimChannel::default()).collect(),
                memory: DeviceMemory {
                    size: config.device_memory,
                    pages: HashMap::new(),
                },
                iova: BTreeMap::new(),
                next_iova: IOVA_BASE,
                stalled: false,
                fail_after: None,
            }),
            mmio_writes: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop (or resume) executing descriptors on every channel.
    pub fn set_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// Execute `descriptors` more descriptors, then stop the next busy channel on error.
    pub fn fail_after(&self, descriptors: u64) {
        self.state().fail_after = Some(descriptors);
    }

    /// Register writes issued so far, over all channels.
    pub fn mmio_writes(&self) -> u64 {
        self.mmio_writes.load(Ordering::Relaxed)
    }

    pub fn descriptors_executed(&self, channel: usize) -> u64 {
        self.state()
            .channels
            .get(channel)
            .map_or(0, |c| c.executed)
    }

    /// Host regions currently reachable by the model.
    pub fn mapped_regions(&self) -> usize {
        self.state().iova.len()
    }

    pub fn device_write(&self, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        self.state().memory.write(addr, data)
    }

    pub fn device_read(&self, addr: u64, len: usize) -> Result<Vec<u8>, DmaError> {
        let mut out = vec![0u8; len];
        self.state().memory.read(addr, &mut out)?;
        Ok(out)
    }
}

impl Accelerator for SimAccelerator {
    fn name(&self) -> String {
        format!("sim[{} channels]", self.state().channels.len())
    }

    fn read_mmio32(&self, offset: u64) -> Result<u32, DmaError> {
        self.state().read32(offset)
    }

    fn read_mmio64(&self, offset: u64) -> Result<u64, DmaError> {
        self.state().read64(offset)
    }

    fn write_mmio32(&self, offset: u64, value: u32) -> Result<(), DmaError> {
        self.mmio_writes.fetch_add(1, Ordering::Relaxed);
        self.state().write32(offset, value)
    }

    fn write_mmio64(&self, offset: u64, value: u64) -> Result<(), DmaError> {
        self.mmio_writes.fetch_add(1, Ordering::Relaxed);
        self.state().write64(offset, value)
    }

    fn map_dma(&self, region: &DmaRegion) -> Result<u64, DmaError> {
        let mut state = self.state();
        let page = page_size() as u64;
        let iova = state.next_iova + region.addr() % page;
        state.next_iova += round_up(region.len() + (region.addr() % page) as usize, page as usize)
            as u64
            + page;
        state.iova.insert(iova, region.clone());
        debug!("sim: mapped {region:?} at I/O address {iova:#x}");
        Ok(iova)
    }

    fn unmap_dma(&self, iova: u64) -> Result<(), DmaError> {
        match self.state().iova.remove(&iova) {
            Some(region) => {
                debug!("sim: unmapped {region:?} from {iova:#x}");
                Ok(())
            }
            None => Err(DmaError::InvalidParam(format!(
                "I/O address {iova:#x} is not mapped"
            ))),
        }
    }
}
