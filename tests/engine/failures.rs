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

use crate::common::sim_setup::{copy, filled_buffer, open_channel, short_budget, sim};
use fpga_dma::config::HOST_MASK;
use fpga_dma::regs::StatusFlags;
use fpga_dma::{
    AlignedBuffer, DmaHandle, FpgaResult, TransferCallback, TransferOutcome,
    TransferType, verify,
};
use googletest::prelude::*;
use rstest::*;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[gtest]
#[rstest]
#[case::host_to_fpga(TransferType::HostToFpga)]
#[case::fpga_to_host(TransferType::FpgaToHost)]
#[case::fpga_to_fpga(TransferType::FpgaToFpga)]
fn zero_length_touches_no_register(#[case] kind: TransferType) -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let buf = AlignedBuffer::allocate(4096)?;
    let (src, dst) = match kind {
        TransferType::HostToFpga => (buf.addr(), 0),
        TransferType::FpgaToHost => (0, buf.addr()),
        TransferType::FpgaToFpga => (0, 0x1000),
    };
    let writes = sim.mmio_writes();
    expect_that!(
        copy(&mut ch, kind, src, dst, 0),
        err(displays_as(contains_substring("DmaError::InvalidParam")))
    );
    expect_eq!(sim.mmio_writes(), writes);
    Ok(())
}

#[gtest]
#[rstest]
#[case::unknown_host_memory(Some(0x1000), 0, 64)]
#[case::past_buffer_end(None, 0, 8192)]
#[case::device_address_with_host_bit(None, HOST_MASK, 64)]
fn unresolvable_ranges_are_rejected(
    #[case] src: Option<u64>,
    #[case] dst: u64,
    #[case] len: u64,
) -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let buf = AlignedBuffer::allocate(4096)?;
    let src = src.unwrap_or(buf.addr());
    let writes = sim.mmio_writes();
    expect_that!(
        copy(&mut ch, TransferType::HostToFpga, src, dst, len),
        err(displays_as(contains_substring("DmaError::InvalidParam")))
    );
    expect_eq!(sim.mmio_writes(), writes);
    Ok(())
}

#[gtest]
fn stalled_channel_times_out_within_budget() -> Result<()> {
    let sim = sim(1);
    let mut ch = DmaHandle::open(sim.clone())?.open_channel_with(0, short_budget())?;
    let buf = filled_buffer(4096)?;
    sim.set_stalled(true);

    let started = Instant::now();
    expect_that!(
        copy(&mut ch, TransferType::HostToFpga, buf.addr(), 0, 4096),
        err(displays_as(contains_substring("DmaError::Timeout")))
    );
    expect_lt!(started.elapsed(), Duration::from_secs(5));
    expect_eq!(ch.in_flight(), 1);

    sim.set_stalled(false);
    ch.wait_for_count(0, Duration::from_secs(5))?;
    expect_eq!(sim.device_read(0, 4096)?, buf.as_slice().to_vec());
    expect_that!(ch.close(), ok(anything()));
    Ok(())
}

#[gtest]
fn wait_for_count_honours_its_deadline() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let buf = filled_buffer(4096)?;
    let mut transfer = ch.init_transfer();
    transfer
        .set_src(buf.addr())
        .set_dst(0)
        .set_len(4096)
        .set_callback(Some(Arc::new(|_| {})));
    sim.set_stalled(true);
    ch.start_transfer(&transfer)?;

    expect_that!(
        ch.wait_for_count(0, Duration::from_millis(50)),
        err(displays_as(contains_substring("DmaError::Timeout")))
    );
    sim.set_stalled(false);
    expect_that!(ch.wait_for_count(0, Duration::from_secs(5)), ok(anything()));
    Ok(())
}

#[gtest]
fn hardware_error_fails_pending_and_channel_recovers() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let buf = filled_buffer(64 * 1024)?;
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    let callback: TransferCallback = Arc::new(move |outcome| {
        sink.lock().expect("outcome log poisoned").push(outcome);
    });

    sim.set_stalled(true);
    let mut transfer = ch.init_transfer();
    transfer.set_len(4096).set_callback(Some(callback));
    for i in 0..4u64 {
        transfer.set_src(buf.addr() + i * 4096).set_dst(i * 4096);
        ch.start_transfer(&transfer)?;
    }
    sim.fail_after(1);
    sim.set_stalled(false);

    expect_that!(
        ch.wait_for_count(0, Duration::from_secs(5)),
        err(displays_as(contains_substring("DmaError::Exception")))
    );
    expect_eq!(ch.in_flight(), 0);
    let seen = outcomes.lock().expect("outcome log poisoned").clone();
    expect_eq!(seen.len(), 4);
    expect_true!(seen.contains(&TransferOutcome::Failed(FpgaResult::Exception)));
    expect_false!(ch.status()?.contains(StatusFlags::STOPPED_ON_ERROR));

    // The channel stays open and usable
    let dst = AlignedBuffer::allocate(64 * 1024)?;
    copy(&mut ch, TransferType::HostToFpga, buf.addr(), 0, 64 * 1024)?;
    copy(&mut ch, TransferType::FpgaToHost, 0, dst.addr(), 64 * 1024)?;
    expect_that!(verify::verify(dst.as_slice()), ok(anything()));
    Ok(())
}

#[gtest]
fn synchronous_start_reports_exception() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let buf = filled_buffer(4096)?;
    sim.fail_after(0);
    expect_that!(
        copy(&mut ch, TransferType::HostToFpga, buf.addr(), 0, 4096),
        err(displays_as(contains_substring("DmaError::Exception")))
    );
    expect_eq!(ch.in_flight(), 0);
    expect_that!(
        copy(&mut ch, TransferType::HostToFpga, buf.addr(), 0, 4096),
        ok(anything())
    );
    Ok(())
}

#[gtest]
fn reset_fails_pending_transfers() -> Result<()> {
    let sim = sim(1);
    let mut ch = open_channel(&sim, 0)?;
    let buf = filled_buffer(4096)?;
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    let mut transfer = ch.init_transfer();
    transfer
        .set_src(buf.addr())
        .set_dst(0)
        .set_len(4096)
        .set_callback(Some(Arc::new(move |outcome| {
            sink.lock().expect("outcome log poisoned").push(outcome);
        })));
    sim.set_stalled(true);
    ch.start_transfer(&transfer)?;
    ch.reset()?;
    sim.set_stalled(false);

    expect_eq!(ch.in_flight(), 0);
    expect_eq!(transfer.pending(), 0);
    expect_eq!(
        *outcomes.lock().expect("outcome log poisoned"),
        vec![TransferOutcome::Failed(FpgaResult::Exception)]
    );
    expect_that!(ch.destroy_transfer(transfer), ok(anything()));
    Ok(())
}

#[gtest]
fn transfer_of_another_channel_is_rejected() -> Result<()> {
    let sim = sim(2);
    let first = open_channel(&sim, 0)?;
    let mut second = open_channel(&sim, 1)?;
    let buf = AlignedBuffer::allocate(4096)?;
    let mut transfer = first.init_transfer();
    transfer.set_src(buf.addr()).set_dst(0).set_len(64);
    expect_that!(
        second.start_transfer(&transfer),
        err(displays_as(contains_substring("DmaError::InvalidParam")))
    );
    Ok(())
}
