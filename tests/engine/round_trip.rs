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

use crate::common::sim_setup::{copy, filled_buffer, open_channel, sim};
use fpga_dma::{AlignedBuffer, TransferType, verify};
use googletest::prelude::*;
use rstest::*;

const MIB: usize = 1024 * 1024;

#[gtest]
#[rstest]
#[case::page(4096)]
#[case::one_mib(MIB)]
#[case::two_mib(2 * MIB)]
#[case::odd(4096 + 3)]
#[case::bounce_plus_tail(MIB + 61)]
#[case::tiny(5)]
fn host_device_host(#[case] len: usize) -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let src = filled_buffer(len)?;
    let dst = AlignedBuffer::allocate(len)?;

    copy(&mut ch, TransferType::HostToFpga, src.addr(), 0, len as u64)?;
    copy(&mut ch, TransferType::FpgaToHost, 0, dst.addr(), len as u64)?;

    expect_that!(verify::verify(dst.as_slice()), ok(anything()));
    expect_eq!(sim.device_read(0, len)?, src.as_slice().to_vec());
    Ok(())
}

/// 10 MiB through the pinned staging ring, back into the same, cleared buffer
#[gtest]
fn ten_megabytes_into_cleared_buffer() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let len = 10 * MIB;
    let mut buf = filled_buffer(len)?;

    copy(&mut ch, TransferType::HostToFpga, buf.addr(), 0, len as u64)?;
    verify::clear(buf.as_mut_slice());
    copy(&mut ch, TransferType::FpgaToHost, 0, buf.addr(), len as u64)?;

    expect_that!(verify::verify(buf.as_slice()), ok(anything()));
    expect_eq!(buf.as_slice()[0], verify::first_pattern_byte());
    Ok(())
}

#[gtest]
#[rstest]
#[case::aligned(0, 0x40_0000, 64 * 1024)]
#[case::unaligned_source(3, 0x40_0000, 64 * 1024)]
#[case::unaligned_destination(0, 0x40_0005, 64 * 1024)]
#[case::unaligned_both(61, 0x40_0007, 3 * MIB + 5)]
fn device_to_device(#[case] src: u64, #[case] dst: u64, #[case] len: usize) -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let pattern = filled_buffer(len)?;
    sim.device_write(src, pattern.as_slice())?;

    copy(&mut ch, TransferType::FpgaToFpga, src, dst, len as u64)?;

    expect_eq!(sim.device_read(dst, len)?, pattern.as_slice().to_vec());
    Ok(())
}

#[gtest]
fn overlapping_device_copy_is_not_supported() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    expect_that!(
        copy(&mut ch, TransferType::FpgaToFpga, 0, 0x800, 0x1000),
        err(displays_as(contains_substring("DmaError::NotSupported")))
    );
    Ok(())
}
