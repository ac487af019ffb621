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

use crate::common::sim_setup::{copy, open_channel, sim};
use fpga_dma::{AlignedBuffer, TransferType, verify};
use googletest::prelude::*;
use rstest::*;

const BUFFER: usize = 192 * 1024;

/// Host pointer offset x size cut, written to a device address that shares the offset
#[gtest]
#[rstest]
fn pointer_and_size_offsets(
    #[values(0, 3, 7, 61)] ptr_align: usize,
    #[values(0, 3, 5, 7, 61)] size_align: usize,
) -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let len = BUFFER - ptr_align - size_align;
    let mut src = AlignedBuffer::allocate(BUFFER)?;
    let dst = AlignedBuffer::allocate(BUFFER)?;
    verify::fill(&mut src.as_mut_slice()[ptr_align..ptr_align + len])?;
    let device = 0x10_0000 + ptr_align as u64;

    copy(
        &mut ch,
        TransferType::HostToFpga,
        src.addr() + ptr_align as u64,
        device,
        len as u64,
    )?;
    copy(
        &mut ch,
        TransferType::FpgaToHost,
        device,
        dst.addr() + ptr_align as u64,
        len as u64,
    )?;

    expect_that!(
        verify::verify(&dst.as_slice()[ptr_align..ptr_align + len]),
        ok(anything())
    );
    // Bytes around the window are untouched
    expect_true!(dst.as_slice()[..ptr_align].iter().all(|b| *b == 0));
    expect_true!(dst.as_slice()[ptr_align + len..].iter().all(|b| *b == 0));
    Ok(())
}

/// Host and device addresses disagree on their offset within a line
#[gtest]
#[rstest]
#[case::host_aligned(0, 0x2003, 10_000)]
#[case::device_aligned(5, 0x2000, 10_000)]
#[case::both_odd(61, 0x2007, 70_001)]
#[case::inside_one_line(7, 0x2011, 20)]
fn mismatched_offsets(
    #[case] ptr_align: usize,
    #[case] device: u64,
    #[case] len: usize,
) -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let mut src = AlignedBuffer::allocate(ptr_align + len)?;
    let dst = AlignedBuffer::allocate(len)?;
    verify::fill(&mut src.as_mut_slice()[ptr_align..])?;

    copy(
        &mut ch,
        TransferType::HostToFpga,
        src.addr() + ptr_align as u64,
        device,
        len as u64,
    )?;
    copy(&mut ch, TransferType::FpgaToHost, device, dst.addr(), len as u64)?;

    expect_that!(verify::verify(dst.as_slice()), ok(anything()));
    Ok(())
}

/// Device bytes next to an unaligned write keep their values
#[gtest]
fn neighbours_of_unaligned_write_survive() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    sim.device_write(0x3000, &[0xa5; 256])?;
    let mut src = AlignedBuffer::allocate(100)?;
    src.as_mut_slice().fill(0x11);

    copy(&mut ch, TransferType::HostToFpga, src.addr(), 0x3003, 100)?;

    let device = sim.device_read(0x3000, 256)?;
    expect_eq!(device[..3].to_vec(), vec![0xa5u8; 3]);
    expect_eq!(device[3..103].to_vec(), vec![0x11u8; 100]);
    expect_eq!(device[103..].to_vec(), vec![0xa5u8; 153]);
    Ok(())
}
