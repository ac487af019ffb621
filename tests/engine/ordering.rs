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

use crate::common::sim_setup::{filled_buffer, open_channel, sim};
use fpga_dma::{AlignedBuffer, TransferCallback, TransferOutcome, TransferType};
use googletest::prelude::*;
use rstest::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<(usize, TransferOutcome)>>>;

fn logging_callback(log: &Log, tag: usize) -> TransferCallback {
    let log = log.clone();
    Arc::new(move |outcome| {
        log.lock().expect("callback log poisoned").push((tag, outcome));
    })
}

fn tags(log: &Log) -> Vec<usize> {
    log.lock()
        .expect("callback log poisoned")
        .iter()
        .map(|(tag, _)| *tag)
        .collect()
}

/// T1 covers [0, L), T2 covers [L, 2L); T1 completes first
#[gtest]
#[rstest]
#[case::one_line(64)]
#[case::page(4096)]
#[case::many_bounce_slots(3 * 1024 * 1024)]
fn adjacent_transfers_complete_in_submission_order(#[case] len: usize) -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let src = filled_buffer(2 * len)?;
    let log: Log = Arc::default();

    let mut first = ch.init_transfer();
    first
        .set_src(src.addr())
        .set_dst(0)
        .set_len(len as u64)
        .set_type(TransferType::HostToFpga)
        .set_callback(Some(logging_callback(&log, 1)));
    let mut second = ch.init_transfer();
    second
        .set_src(src.addr() + len as u64)
        .set_dst(len as u64)
        .set_len(len as u64)
        .set_type(TransferType::HostToFpga)
        .set_callback(Some(logging_callback(&log, 2)));

    ch.start_transfer(&first)?;
    ch.start_transfer(&second)?;
    ch.wait_for_count(0, Duration::from_secs(10))?;

    expect_eq!(tags(&log), vec![1, 2]);
    expect_eq!(sim.device_read(0, 2 * len)?, src.as_slice().to_vec());
    Ok(())
}

/// Later writes to the same device bytes win
#[gtest]
fn overlapping_writes_land_in_order() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let mut ones = AlignedBuffer::allocate(8192)?;
    ones.as_mut_slice().fill(1);
    let mut twos = AlignedBuffer::allocate(4096)?;
    twos.as_mut_slice().fill(2);
    let log: Log = Arc::default();

    let mut transfer = ch.init_transfer();
    transfer
        .set_src(ones.addr())
        .set_dst(0)
        .set_len(8192)
        .set_callback(Some(logging_callback(&log, 1)));
    ch.start_transfer(&transfer)?;
    transfer
        .set_src(twos.addr())
        .set_dst(2048)
        .set_len(4096)
        .set_callback(Some(logging_callback(&log, 2)));
    ch.start_transfer(&transfer)?;
    ch.wait_for_count(0, Duration::from_secs(10))?;

    let device = sim.device_read(0, 8192)?;
    expect_eq!(device[..2048].to_vec(), vec![1u8; 2048]);
    expect_eq!(device[2048..6144].to_vec(), vec![2u8; 4096]);
    expect_eq!(device[6144..].to_vec(), vec![1u8; 2048]);
    expect_eq!(tags(&log), vec![1, 2]);
    expect_eq!(transfer.pending(), 0);
    Ok(())
}

/// One transfer object restarted many times keeps every start's parameters
#[gtest]
fn restarted_transfer_is_fifo() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let src = filled_buffer(64 * 1024)?;
    let log: Log = Arc::default();

    let mut transfer = ch.init_transfer();
    transfer.set_len(4096).set_type(TransferType::HostToFpga);
    for i in 0..16usize {
        transfer
            .set_src(src.addr() + (i * 4096) as u64)
            .set_dst(0x8_0000 + (i * 4096) as u64)
            .set_callback(Some(logging_callback(&log, i)));
        ch.start_transfer(&transfer)?;
    }
    ch.wait_for_count(0, Duration::from_secs(10))?;

    expect_eq!(tags(&log), (0..16).collect::<Vec<_>>());
    expect_eq!(sim.device_read(0x8_0000, 64 * 1024)?, src.as_slice().to_vec());
    Ok(())
}

/// A host-to-device transfer reads what an earlier device-to-host transfer wrote
#[gtest]
#[rstest]
#[case::aligned(0x1_0000)]
#[case::unaligned_edges(0x1_0003)]
fn read_back_then_write_out_sees_fresh_host_bytes(#[case] dst: u64) -> Result<()> {
    let sim = sim(1);
    let pattern = filled_buffer(4096)?;
    sim.device_write(0, pattern.as_slice())?;
    let mut ch = open_channel(&sim, 0)?;
    let buf = AlignedBuffer::allocate(4096)?;
    let log: Log = Arc::default();

    let mut read_back = ch.init_transfer();
    read_back
        .set_src(0)
        .set_dst(buf.addr())
        .set_len(4096)
        .set_type(TransferType::FpgaToHost)
        .set_callback(Some(logging_callback(&log, 1)));
    ch.start_transfer(&read_back)?;

    let mut write_out = ch.init_transfer();
    write_out
        .set_src(buf.addr())
        .set_dst(dst)
        .set_len(4096)
        .set_type(TransferType::HostToFpga);
    ch.start_transfer(&write_out)?;
    ch.wait_for_count(0, Duration::from_secs(10))?;

    expect_eq!(tags(&log), vec![1]);
    expect_eq!(buf.as_slice().to_vec(), pattern.as_slice().to_vec());
    expect_eq!(sim.device_read(dst, 4096)?, pattern.as_slice().to_vec());
    Ok(())
}
