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

//! fpga-dma-bench - bandwidth and integrity bench for the fpga-dma engine.
//!
//! Runs the memory-mapped test sequence or DDR sweeps on one or more DMA channels of a
//! DFL port, or of the in-process simulator with `--sim`. Selected channels run
//! concurrently, each on its own blocking task.
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`

mod channels;
mod mm;
mod sweep;

use clap::{Parser, Subcommand};
use fpga_dma::dfl::{DEV_DIR, DflPort, list_ports};
use fpga_dma::sim::SimAccelerator;
use fpga_dma::{Accelerator, DmaChannel, DmaError, DmaHandle};
use log::{debug, info};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Channels of the simulated accelerator.
const SIM_CHANNELS: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "fpga-dma-bench")]
#[command(bin_name = "fpga-dma-bench")]
struct Cli {
    #[arg(long, conflicts_with = "port", help = "Run against the in-process simulator")]
    sim: bool,
    #[arg(
        long,
        help = r#"DFL port device to use, e.g. /dev/dfl-port.0.
Defaults to the first dfl-port.* node under /dev.
        "#
    )]
    port: Option<PathBuf>,
    #[arg(
        long = "channel",
        help = "DMA channel to run on; repeat to run several channels concurrently"
    )]
    channels: Vec<usize>,
    #[arg(long, help = "Iterations of each loop, overriding the test's default")]
    iterations: Option<u32>,
    #[arg(
        long,
        default_value_t = 256 * 1024 * 1024,
        help = "Device memory reserved per selected channel; channel k starts at k * stride"
    )]
    device_stride: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Round trip, device copy, small transfer loops and DDR sweeps
    Mm {
        #[arg(long, help = "Run every DDR sweep instead of the short set")]
        full_sweep: bool,
    },
    /// Time repeated writes and reads of one buffer
    Sweep {
        #[arg(long, default_value_t = 0, help = "Bytes to move the buffer start up by")]
        ptr_align: usize,
        #[arg(long, default_value_t = 0, help = "Bytes to cut from the buffer end")]
        size_align: usize,
        #[arg(long, help = "Buffer size in bytes [default: 2096 MiB, 4 MiB with --sim]")]
        size: Option<usize>,
        #[arg(long, default_value_t = 0, help = "Device address to write to")]
        dst: u64,
        #[arg(long, conflicts_with_all = ["ptr_align", "size_align", "size", "dst"],
            help = "Run the full set of aligned and unaligned sweeps")]
        all: bool,
    },
    /// List the DMA channels of the accelerator
    Channels,
}

pub type JobError = Box<dyn Error + Send + Sync>;

/// Work for one channel, run on a blocking task. Gets the channel and its device base.
type ChannelJob = Arc<dyn Fn(DmaChannel, u64) -> Result<String, JobError> + Send + Sync>;

fn open_accelerator(sim: bool, port: &Option<PathBuf>) -> Result<Arc<dyn Accelerator>, DmaError> {
    if sim {
        info!("Using the simulated accelerator with {SIM_CHANNELS} channels");
        return Ok(Arc::new(SimAccelerator::new(SIM_CHANNELS)));
    }
    let path = match port {
        Some(path) => path.clone(),
        None => list_ports(Path::new(DEV_DIR))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DmaError::InvalidParam(format!(
                    "no dfl-port device found in {DEV_DIR}; use --port or --sim"
                ))
            })?,
    };
    Ok(Arc::new(DflPort::open(&path)?))
}

/// Open every selected channel, then run `job` on each one concurrently.
async fn run_on_channels(
    handle: &DmaHandle,
    channels: &[usize],
    device_stride: u64,
    job: ChannelJob,
) -> Result<(), Box<dyn Error>> {
    let mut tasks: Vec<(usize, JoinHandle<Result<String, JobError>>)> = Vec::new();
    for (k, index) in channels.iter().enumerate() {
        let ch = handle.open_channel(*index)?;
        let job = job.clone();
        let base = k as u64 * device_stride;
        tasks.push((*index, tokio::task::spawn_blocking(move || job(ch, base))));
    }

    let mut outputs = Vec::new();
    let mut failed = 0;
    for (index, task) in tasks {
        match task.await? {
            Ok(text) => outputs.push(text),
            Err(e) => {
                failed += 1;
                outputs.push(format!("channel {index}: {e}"));
            }
        }
    }
    for text in &outputs {
        println!("{text}");
    }
    if failed > 0 {
        return Err(format!("{failed} channel(s) failed").into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    debug!("parsed cli command with {cli:?}");

    let accel = open_accelerator(cli.sim, &cli.port)?;
    let handle = DmaHandle::open(accel)?;
    let channels = if cli.channels.is_empty() {
        vec![0]
    } else {
        cli.channels.clone()
    };

    match cli.command {
        Commands::Channels => {
            println!("{}", channels::channels_handler(&handle)?);
        }
        Commands::Mm { full_sweep } => {
            let config = mm::mm_config(cli.sim, cli.iterations, full_sweep);
            let job: ChannelJob = Arc::new(move |ch, base| mm::mm_handler(ch, &config, base));
            run_on_channels(&handle, &channels, cli.device_stride, job).await?;
        }
        Commands::Sweep {
            ptr_align,
            size_align,
            size,
            dst,
            all,
        } => {
            let sweeps = sweep::sweep_set(cli.sim, all, ptr_align, size_align, size, dst);
            let iterations = cli.iterations;
            let job: ChannelJob =
                Arc::new(move |ch, base| sweep::sweep_handler(ch, &sweeps, iterations, base));
            run_on_channels(&handle, &channels, cli.device_stride, job).await?;
        }
    }
    Ok(())
}
