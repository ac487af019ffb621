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

//! Register layout of a memory-to-memory DMA channel.
//!
//! Each channel is a feature in the accelerator's device feature header (DFH) list.
//! All offsets here are relative to the channel's feature base.

use crate::error::DmaError;
use crate::mmio::Accelerator;
use bitflags::bitflags;
use log::{debug, trace};

pub const M2M_DMA_UUID_H: u64 = 0xef82_def7_f6ec_40fc;
pub const M2M_DMA_UUID_L: u64 = 0xa914_9a35_bace_01ea;

pub const DFH_TYPE_AFU: u8 = 1;
pub const DFH_TYPE_BBB: u8 = 2;

/// Size of the address-span window onto device memory.
pub const WINDOW_SIZE: u64 = 0x1000;

/// Guard against malformed feature lists that loop back on themselves.
const MAX_FEATURES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ChannelReg {
    Dfh = 0x00,
    GuidL = 0x08,
    GuidH = 0x10,
    Status = 0x40,
    Control = 0x44,
    FillLevel = 0x48,
    RspFillLevel = 0x4C,
    SeqNum = 0x50,
    /// First of eight descriptor words. Writing the last word enqueues the descriptor.
    Descriptor = 0x60,
    SpanPage = 0x200,
    SpanData = 0x1000,
}

impl std::ops::Add<ChannelReg> for u64 {
    type Output = Self;

    fn add(self, b: ChannelReg) -> u64 {
        b as u64 + self
    }
}

bitflags! {
    /// Dispatcher CSR status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u32 {
        const BUSY = 1 << 0;
        const DESC_BUF_EMPTY = 1 << 1;
        const DESC_BUF_FULL = 1 << 2;
        const RSP_BUF_EMPTY = 1 << 3;
        const RSP_BUF_FULL = 1 << 4;
        const STOPPED = 1 << 5;
        const RESETTING = 1 << 6;
        const STOPPED_ON_ERROR = 1 << 7;
        const STOPPED_ON_EARLY_TERM = 1 << 8;
        const IRQ = 1 << 9;
    }
}

bitflags! {
    /// Dispatcher CSR control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlFlags: u32 {
        const STOP_DISPATCHER = 1 << 0;
        const RESET_DISPATCHER = 1 << 1;
        const STOP_ON_ERROR = 1 << 2;
        const STOP_ON_EARLY_TERM = 1 << 3;
        const GLOBAL_INTR_EN = 1 << 4;
        const STOP_DESCRIPTORS = 1 << 5;
    }
}

bitflags! {
    /// Control word of a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorControl: u32 {
        const GENERATE_SOP = 1 << 8;
        const GENERATE_EOP = 1 << 9;
        const PARK_READS = 1 << 10;
        const PARK_WRITES = 1 << 11;
        const END_ON_EOP = 1 << 12;
        const TRANSFER_IRQ_EN = 1 << 14;
        const EARLY_TERM_IRQ_EN = 1 << 15;
        const EARLY_DONE_EN = 1 << 24;
        const WAIT_FOR_WR_RSP = 1 << 25;
        const GO = 1 << 31;
    }
}

pub const DESCRIPTOR_WORDS: usize = 8;
const UNIT_STRIDE: u32 = 0x0001_0001;

/// A memory-to-memory descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub rd_address: u64,
    pub wr_address: u64,
    pub len: u32,
    pub seq_num: u16,
    pub rd_burst: u8,
    pub wr_burst: u8,
    pub control: DescriptorControl,
}

impl Descriptor {
    /// Register image, in the order the words are written.
    pub fn to_words(&self) -> [u32; DESCRIPTOR_WORDS] {
        [
            self.rd_address as u32,
            self.wr_address as u32,
            self.len,
            ((self.seq_num as u32) << 16) | ((self.rd_burst as u32) << 8) | self.wr_burst as u32,
            UNIT_STRIDE,
            (self.rd_address >> 32) as u32,
            (self.wr_address >> 32) as u32,
            self.control.bits(),
        ]
    }

    pub fn from_words(words: &[u32; DESCRIPTOR_WORDS]) -> Self {
        Descriptor {
            rd_address: (words[5] as u64) << 32 | words[0] as u64,
            wr_address: (words[6] as u64) << 32 | words[1] as u64,
            len: words[2],
            seq_num: (words[3] >> 16) as u16,
            rd_burst: (words[3] >> 8) as u8,
            wr_burst: words[3] as u8,
            control: DescriptorControl::from_bits_retain(words[7]),
        }
    }
}

/// A device feature header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dfh(pub u64);

impl Dfh {
    pub fn feature_id(&self) -> u16 {
        (self.0 & 0xfff) as u16
    }

    /// Offset from this header to the next one. Zero ends the list.
    pub fn next_offset(&self) -> u64 {
        (self.0 >> 16) & 0xff_ffff
    }

    pub fn end_of_list(&self) -> bool {
        self.0 & (1 << 40) != 0
    }

    pub fn feature_type(&self) -> u8 {
        (self.0 >> 60) as u8
    }

    pub fn new(feature_type: u8, next_offset: u64, end_of_list: bool, feature_id: u16) -> Self {
        Dfh(((feature_type as u64) << 60)
            | (u64::from(end_of_list) << 40)
            | ((next_offset & 0xff_ffff) << 16)
            | (feature_id & 0xfff) as u64)
    }
}

/// Walk the feature list and return the base offset of every DMA channel, in list order.
///
/// # Returns: `Result<Vec<u64>, DmaError>`
/// * `Ok(Vec<u64>)` - Channel base offsets, possibly empty
/// * `Err(DmaError::Internal)` - The list does not terminate
pub fn discover_channels(accel: &dyn Accelerator) -> Result<Vec<u64>, DmaError> {
    let mut channels = Vec::new();
    let mut offset = 0u64;
    for _ in 0..MAX_FEATURES {
        let dfh = Dfh(accel.read_mmio64(offset + ChannelReg::Dfh)?);
        trace!("DFH at {offset:#x}: {dfh:x?}");
        if dfh.feature_type() == DFH_TYPE_BBB {
            let guid_l = accel.read_mmio64(offset + ChannelReg::GuidL)?;
            let guid_h = accel.read_mmio64(offset + ChannelReg::GuidH)?;
            if guid_l == M2M_DMA_UUID_L && guid_h == M2M_DMA_UUID_H {
                debug!("Found DMA channel {} at {offset:#x}", channels.len());
                channels.push(offset);
            }
        }
        if dfh.end_of_list() || dfh.next_offset() == 0 {
            return Ok(channels);
        }
        offset += dfh.next_offset();
    }
    Err(DmaError::Internal(format!(
        "feature list on {} has more than {MAX_FEATURES} entries",
        accel.name()
    )))
}
