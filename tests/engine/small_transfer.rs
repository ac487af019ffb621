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

use crate::common::sim_setup::{open_channel, sim};
use fpga_dma::{DmaError, TransferCallback, TransferOutcome, TransferType, verify};
use googletest::prelude::*;
use rstest::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const TWO_MIB: usize = 2 * 1024 * 1024;

fn counting_callback(count: &Arc<AtomicU64>) -> TransferCallback {
    let count = count.clone();
    Arc::new(move |outcome| {
        if outcome == TransferOutcome::Completed {
            count.fetch_add(1, Ordering::Relaxed);
        }
    })
}

/// 1000 rounds of asynchronous 4 KiB writes covering a 2 MiB scratch buffer
#[gtest]
fn thousand_rounds_of_async_page_writes() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let mut small = ch.init_small_transfer(TWO_MIB)?;
    let base = small.scratch_addr().unwrap_or_default();
    expect_ne!(base, 0);
    let scratch = small
        .scratch_mut()
        .ok_or_else(|| DmaError::Busy("scratch in use".to_string()))?;
    verify::fill(scratch)?;

    let completions = Arc::new(AtomicU64::new(0));
    small
        .set_len(0x1000)
        .set_type(TransferType::HostToFpga)
        .set_callback(Some(counting_callback(&completions)));
    let per_round = (TWO_MIB / 0x1000) as u64;
    for _ in 0..1000 {
        for i in 0..per_round {
            small
                .set_src(base + i * 0x1000)
                .set_dst(0x200 + i * 0x1000);
            ch.start_transfer(&small)?;
        }
        ch.wait_for_count(0, Duration::from_secs(30))?;
    }

    expect_eq!(ch.in_flight(), 0);
    expect_eq!(completions.load(Ordering::Acquire), 1000 * 512);
    expect_eq!(small.scratch_addr(), Some(base));
    let device = sim.device_read(0x200, TWO_MIB)?;
    expect_that!(verify::verify(&device), ok(anything()));
    Ok(())
}

/// Starting one small transfer many times never moves its scratch memory
#[gtest]
fn scratch_is_stable_across_starts() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let mut small = ch.init_small_transfer(64 * 1024)?;
    let base = small.scratch_addr().unwrap_or_default();
    let mapped = sim.mapped_regions();

    for round in 0..64u8 {
        if let Some(scratch) = small.scratch_mut() {
            scratch[..256].fill(round);
        }
        small
            .set_src(base)
            .set_dst(0x1000 * round as u64)
            .set_len(256)
            .set_type(TransferType::HostToFpga);
        ch.start_transfer(&small)?;
        expect_eq!(small.scratch_addr(), Some(base));
        expect_eq!(sim.device_read(0x1000 * round as u64, 256)?, vec![round; 256]);
    }
    expect_eq!(sim.mapped_regions(), mapped);
    Ok(())
}

/// The check the bench runs: an unaligned window out, back to a different offset
#[gtest]
fn unaligned_window_of_scratch() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let mut small = ch.init_small_transfer(TWO_MIB)?;
    let base = small.scratch_addr().unwrap_or_default();
    if let Some(scratch) = small.scratch_mut() {
        verify::fill(&mut scratch[2048 + 5..2048 + 5 + 0x3800])?;
    }

    small
        .set_src(base + 2048 + 5)
        .set_dst(0x203)
        .set_len(0x3800)
        .set_type(TransferType::HostToFpga);
    ch.start_transfer(&small)?;
    if let Some(scratch) = small.scratch_mut() {
        verify::clear(scratch);
    }
    small
        .set_src(0x203)
        .set_dst(base + 1024 + 7)
        .set_type(TransferType::FpgaToHost);
    ch.start_transfer(&small)?;

    let scratch = small.scratch().unwrap_or_default();
    expect_that!(verify::verify(&scratch[1024 + 7..1024 + 7 + 0x3800]), ok(anything()));
    Ok(())
}

#[gtest]
#[rstest]
#[case::zero(0, err(displays_as(contains_substring("DmaError::InvalidParam"))))]
#[case::too_big(TWO_MIB + 1, err(displays_as(contains_substring("DmaError::InvalidParam"))))]
#[case::largest(TWO_MIB, ok(anything()))]
#[case::one_byte(1, ok(anything()))]
fn scratch_size_limits<M: for<'a> Matcher<&'a std::result::Result<fpga_dma::Transfer, DmaError>>>(
    #[case] size: usize,
    #[case] condition: M,
) -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    expect_that!(ch.init_small_transfer(size), condition);
    Ok(())
}

#[gtest]
fn scratch_count_limit_frees_on_destroy() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(ch.init_small_transfer(4096)?);
    }
    expect_that!(
        ch.init_small_transfer(4096),
        err(displays_as(contains_substring("DmaError::NoMemory")))
    );
    let released = held.pop().ok_or_else(|| DmaError::Internal("no transfer".to_string()))?;
    ch.destroy_transfer(released).map_err(|(_, e)| e)?;
    expect_that!(ch.init_small_transfer(4096), ok(anything()));
    Ok(())
}

#[gtest]
fn scratch_of_another_channel_is_rejected() -> Result<()> {
    let sim = sim(2);
    let mut first = open_channel(&sim, 0)?;
    let mut second = open_channel(&sim, 1)?;
    let mut small = first.init_small_transfer(4096)?;
    let base = small.scratch_addr().unwrap_or_default();
    small.set_src(base).set_dst(0).set_len(64);
    expect_that!(
        second.start_transfer(&small),
        err(displays_as(contains_substring("DmaError::InvalidParam")))
    );
    expect_that!(first.start_transfer(&small), ok(anything()));
    Ok(())
}
