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

use crate::common::sim_setup::{copy, filled_buffer, sim, test_config};
use fpga_dma::bench::{MmTestConfig, run_mm_test};
use fpga_dma::{AlignedBuffer, DmaError, DmaHandle, TransferType, verify};
use googletest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const CHANNELS: usize = 4;
const REGION: u64 = 64 * 1024 * 1024;

#[gtest]
#[tokio::test]
async fn channels_run_on_separate_threads() -> Result<()> {
    let sim = sim(CHANNELS);
    let handle = DmaHandle::open(sim.clone())?;
    let mut tasks = Vec::new();
    for index in 0..CHANNELS {
        let mut ch = handle.open_channel_with(index, test_config())?;
        tasks.push(tokio::task::spawn_blocking(move || -> std::result::Result<(), DmaError> {
            let len = 1024 * 1024 + 7 * index;
            let device = index as u64 * REGION;
            let src = filled_buffer(len)?;
            let mut dst = AlignedBuffer::allocate(len)?;
            for _ in 0..4 {
                verify::clear(dst.as_mut_slice());
                copy(&mut ch, TransferType::HostToFpga, src.addr(), device, len as u64)?;
                copy(&mut ch, TransferType::FpgaToHost, device, dst.addr(), len as u64)?;
                verify::verify(dst.as_slice())?;
            }
            ch.close().map_err(|(_, e)| e)
        }));
    }
    for task in tasks {
        expect_that!(task.await?, ok(anything()));
    }
    for index in 0..CHANNELS {
        expect_true!(sim.descriptors_executed(index) > 0);
    }
    Ok(())
}

/// The in-flight counter can be watched from another thread
#[gtest]
#[tokio::test]
async fn in_flight_counter_is_shared() -> Result<()> {
    let sim = sim(1);
    let mut ch = DmaHandle::open(sim.clone())?.open_channel_with(0, test_config())?;
    let counter = ch.in_flight_counter();
    let buf = filled_buffer(64 * 1024)?;
    let mut transfer = ch.init_transfer();
    transfer
        .set_src(buf.addr())
        .set_dst(0)
        .set_len(4096)
        .set_callback(Some(Arc::new(|_| {})));

    sim.set_stalled(true);
    for _ in 0..6 {
        ch.start_transfer(&transfer)?;
    }
    let watcher = tokio::task::spawn_blocking({
        let counter = counter.clone();
        move || counter.load(Ordering::Acquire)
    });
    expect_eq!(watcher.await?, 6);

    sim.set_stalled(false);
    let ch = tokio::task::spawn_blocking(move || {
        ch.wait_for_count(0, Duration::from_secs(5)).map(|_| ch)
    })
    .await??;
    expect_eq!(counter.load(Ordering::Acquire), 0);
    expect_that!(ch.close(), ok(anything()));
    Ok(())
}

/// The bench sequence on every channel at once, each in its own device region
#[gtest]
#[tokio::test]
async fn bench_sequence_on_all_channels() -> Result<()> {
    let sim = sim(CHANNELS);
    let handle = DmaHandle::open(sim)?;
    let mut tasks = Vec::new();
    for index in 0..CHANNELS {
        let mut ch = handle.open_channel_with(index, test_config())?;
        let config = MmTestConfig {
            buffer_size: 256 * 1024,
            small_buffer_size: 64 * 1024,
            small_iterations: 2,
            sweeps: Vec::new(),
            device_base: index as u64 * REGION,
            ..MmTestConfig::default()
        };
        tasks.push(tokio::task::spawn_blocking(move || {
            run_mm_test(&mut ch, &config).map(|report| report.failures())
        }));
    }
    for task in tasks {
        expect_eq!(task.await??, 0);
    }
    Ok(())
}
