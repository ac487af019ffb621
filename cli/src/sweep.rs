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

use crate::JobError;
use fpga_dma::DmaChannel;
use fpga_dma::bench::{SWEEP_ITERATIONS, Sweep, ddr_sweep};
use log::error;

const HW_SWEEP_SIZE: usize = 2096 * 1024 * 1024;
const SIM_SWEEP_SIZE: usize = 4 * 1024 * 1024;

/// The sweeps selected on the command line
pub fn sweep_set(
    sim: bool,
    all: bool,
    ptr_align: usize,
    size_align: usize,
    size: Option<usize>,
    dst: u64,
) -> Vec<Sweep> {
    if all {
        return Sweep::full_set();
    }
    let default_size = if sim { SIM_SWEEP_SIZE } else { HW_SWEEP_SIZE };
    vec![Sweep::new(
        ptr_align,
        size_align,
        size.unwrap_or(default_size),
        dst,
    )]
}

/// Runs every sweep on `ch`, carrying on past failures, and closes it
pub fn sweep_handler(
    mut ch: DmaChannel,
    sweeps: &[Sweep],
    iterations: Option<u32>,
    device_base: u64,
) -> Result<String, JobError> {
    let index = ch.index();
    let iterations = iterations.unwrap_or(SWEEP_ITERATIONS);
    let mut lines = Vec::new();
    let mut failed = 0;
    for sweep in sweeps {
        let name = format!(
            "channel {index}: sweep of {:#x} bytes (pointer +{}, size -{}) to {:#x}",
            sweep.size, sweep.ptr_align, sweep.size_align, sweep.dst
        );
        match ddr_sweep(&mut ch, sweep, iterations, device_base) {
            Ok(report) => {
                lines.push(format!("{name}: Host to FPGA: {}", report.to_device));
                lines.push(format!("{name}: FPGA to Host: {}", report.from_device));
            }
            Err(e) => {
                error!("{name} failed: {e}");
                failed += 1;
                lines.push(format!("{name}: FAILED: {e}"));
            }
        }
    }
    ch.close().map_err(|(_, e)| e)?;

    let text = lines.join("\n");
    match failed {
        0 => Ok(text),
        n => Err(format!("{n} sweep(s) failed\n{text}").into()),
    }
}
