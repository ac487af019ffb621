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
use fpga_dma::bench::{MmTestConfig, MmTestReport, Sweep, run_mm_test};
use std::fmt::Write;

/// Small loop iterations on the simulator unless `--iterations` is given.
const SIM_SMALL_ITERATIONS: u32 = 10;

/// Builds the test configuration from the command line options
pub fn mm_config(sim: bool, iterations: Option<u32>, full_sweep: bool) -> MmTestConfig {
    let mut config = if sim {
        MmTestConfig {
            small_iterations: SIM_SMALL_ITERATIONS,
            ..MmTestConfig::simulation()
        }
    } else {
        MmTestConfig::default()
    };
    if let Some(iterations) = iterations {
        config.small_iterations = iterations;
        config.sweep_iterations = iterations;
    }
    if full_sweep {
        config.sweeps = Sweep::full_set();
    }
    config
}

/// One line per step, and per measurement of a passing step
fn format_report(index: usize, report: &MmTestReport) -> String {
    let mut out = String::new();
    for step in &report.steps {
        match &step.outcome {
            Ok(measurements) if measurements.is_empty() => {
                let _ = writeln!(out, "channel {index}: {}: ok", step.name);
            }
            Ok(measurements) => {
                for m in measurements {
                    let _ = writeln!(out, "channel {index}: {}: {m}", step.name);
                }
            }
            Err(e) => {
                let _ = writeln!(out, "channel {index}: {}: FAILED: {e}", step.name);
            }
        }
    }
    out.trim_end().to_string()
}

/// Runs the memory-mapped test sequence on `ch` and closes it
pub fn mm_handler(
    mut ch: DmaChannel,
    config: &MmTestConfig,
    device_base: u64,
) -> Result<String, JobError> {
    let config = MmTestConfig {
        device_base,
        ..config.clone()
    };
    let index = ch.index();
    let report = run_mm_test(&mut ch, &config)?;
    ch.close().map_err(|(_, e)| e)?;

    let text = format_report(index, &report);
    match report.failures() {
        0 => Ok(text),
        n => Err(format!("{n} step(s) failed\n{text}").into()),
    }
}
