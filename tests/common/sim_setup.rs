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

use fpga_dma::config::{ChannelConfig, EngineConfig, PollPolicy};
use fpga_dma::sim::SimAccelerator;
use fpga_dma::{AlignedBuffer, DmaChannel, DmaError, DmaHandle, TransferType, verify};
use std::sync::Arc;
use std::time::Duration;

/// Generous polling so slow CI machines never hit the budget by accident
pub fn test_config() -> EngineConfig {
    EngineConfig {
        polling: PollPolicy {
            max_polls: 10_000_000,
            yield_after: 64,
            sleep_after: u64::MAX,
            sleep: Duration::ZERO,
        },
        channel: ChannelConfig::default(),
    }
}

/// A tight budget for tests that expect to run out of it
pub fn short_budget() -> EngineConfig {
    EngineConfig {
        polling: PollPolicy {
            max_polls: 500,
            yield_after: 16,
            sleep_after: u64::MAX,
            sleep: Duration::ZERO,
        },
        ..test_config()
    }
}

/// Captured logging, honouring `RUST_LOG`. Later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

pub fn sim(channels: usize) -> Arc<SimAccelerator> {
    init_logging();
    Arc::new(SimAccelerator::new(channels))
}

pub fn open_channel(sim: &Arc<SimAccelerator>, index: usize) -> Result<DmaChannel, DmaError> {
    DmaHandle::open(sim.clone())?.open_channel_with(index, test_config())
}

/// An aligned buffer of `len` bytes filled with the test pattern
pub fn filled_buffer(len: usize) -> Result<AlignedBuffer, DmaError> {
    let mut buf = AlignedBuffer::allocate(len)?;
    verify::fill(buf.as_mut_slice())?;
    Ok(buf)
}

/// Synchronously move `len` bytes from `src` to `dst`
pub fn copy(
    ch: &mut DmaChannel,
    kind: TransferType,
    src: u64,
    dst: u64,
    len: u64,
) -> Result<(), DmaError> {
    let mut transfer = ch.init_transfer();
    transfer.set_src(src).set_dst(dst).set_len(len).set_type(kind);
    ch.start_transfer(&transfer)?;
    ch.destroy_transfer(transfer).map_err(|(_, e)| e)
}
