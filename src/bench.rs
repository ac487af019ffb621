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

//! Bandwidth and integrity harness.
//!
//! [`run_mm_test`] drives one channel through the memory-mapped test sequence: a host
//! round trip, a device-to-device copy, the small-transfer checks and loops, and finally
//! the DDR sweeps. Every step verifies its data with [`crate::verify`]. A failing step is
//! logged and recorded, and the sequence moves on to the next one.

use crate::buffer::AlignedBuffer;
use crate::channel::DmaChannel;
use crate::error::DmaError;
use crate::transfer::{Transfer, TransferCallback, TransferOutcome, TransferType};
use crate::verify;
use log::{error, info};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MIB: usize = 1024 * 1024;

pub const TEST_BUFFER_SIZE: usize = 10 * MIB;
pub const SIM_TEST_BUFFER_SIZE: usize = 4 * 1024;
pub const SMALL_BUFFER_SIZE: usize = 2 * MIB;
pub const SMALL_CHUNK: usize = 0x1000;
pub const SMALL_ITERATIONS: u32 = 1000;
pub const SWEEP_ITERATIONS: u32 = 10;

/// Device address the small loops with 4 KiB chunks write to.
const SMALL_DEVICE_ADDR: u64 = 0x200;
const SMALL_CHECK_LEN: usize = 0x3800;

/// Bytes moved over a measured time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthReport {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl BandwidthReport {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        BandwidthReport { bytes, elapsed }
    }

    /// Throughput in megabytes (10^6 bytes) per second. Zero when nothing was timed.
    pub fn megabytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (secs * 1_000_000.0)
    }
}

impl fmt::Display for BandwidthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Measured bandwidth = {:.3} Megabytes/sec", self.megabytes_per_sec())
    }
}

/// A labelled bandwidth figure of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub label: String,
    pub bandwidth: BandwidthReport,
}

impl Measurement {
    fn new(label: impl Into<String>, bandwidth: BandwidthReport) -> Self {
        Measurement {
            label: label.into(),
            bandwidth,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.bandwidth)
    }
}

/// One DDR sweep: a buffer of `size` bytes whose start is moved up by `ptr_align` and
/// whose length is cut by `ptr_align + size_align`, written to device address `dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub ptr_align: usize,
    pub size_align: usize,
    pub size: usize,
    pub dst: u64,
}

impl Sweep {
    pub fn new(ptr_align: usize, size_align: usize, size: usize, dst: u64) -> Self {
        Sweep {
            ptr_align,
            size_align,
            size,
            dst,
        }
    }

    /// Bytes actually transferred.
    pub fn len(&self) -> usize {
        self.size.saturating_sub(self.ptr_align + self.size_align)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single aligned sweep of the short test.
    pub fn short_set() -> Vec<Sweep> {
        vec![Sweep::new(0, 0, 2096 * MIB, 0)]
    }

    /// Every sweep, aligned ones first, then unaligned pointers and sizes.
    pub fn full_set() -> Vec<Sweep> {
        vec![
            Sweep::new(0, 0, 2096 * MIB, 0),
            Sweep::new(0, 0, 10 * MIB, 0),
            Sweep::new(0, 0, MIB, 200),
            Sweep::new(0, 0, 4096, 200),
            Sweep::new(61, 5, 3 * MIB, 3),
            Sweep::new(3, 0, 22 * MIB, 6),
            Sweep::new(7, 3, 1024 * MIB, 0xfc00),
            Sweep::new(0, 3, 2048 * MIB, 0),
            Sweep::new(0, 61, 4096 * MIB, 1),
            Sweep::new(0, 7, 4096 * MIB, 0),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepReport {
    pub to_device: BandwidthReport,
    pub from_device: BandwidthReport,
}

/// Parameters of a small-transfer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallLoop {
    pub kind: TransferType,
    /// Bytes per start. The scratch buffer is covered in `scratch_len / chunk` starts.
    pub chunk: usize,
    /// Device address of the first chunk.
    pub device_addr: u64,
    pub iterations: u32,
    pub asynchronous: bool,
    /// Limit on waiting for the asynchronous starts of one iteration.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmallLoopReport {
    pub transfers: u64,
    /// Callbacks that reported success. Zero for synchronous loops.
    pub completions: u64,
    pub failures: u64,
    pub total: BandwidthReport,
    /// Time spent queueing only, for asynchronous loops.
    pub send_only: Option<BandwidthReport>,
}

#[derive(Debug, Clone)]
pub struct MmTestConfig {
    /// Size of the round trip and device copy buffer.
    pub buffer_size: usize,
    pub small_buffer_size: usize,
    pub small_iterations: u32,
    pub sweep_iterations: u32,
    pub sweeps: Vec<Sweep>,
    /// Added to every device address, so channels can share device memory.
    pub device_base: u64,
    pub wait_timeout: Duration,
}

impl Default for MmTestConfig {
    fn default() -> Self {
        MmTestConfig {
            buffer_size: TEST_BUFFER_SIZE,
            small_buffer_size: SMALL_BUFFER_SIZE,
            small_iterations: SMALL_ITERATIONS,
            sweep_iterations: SWEEP_ITERATIONS,
            sweeps: Sweep::short_set(),
            device_base: 0,
            wait_timeout: Duration::from_secs(60),
        }
    }
}

impl MmTestConfig {
    /// A short run for the simulator: a page-sized round trip and no sweeps.
    pub fn simulation() -> Self {
        MmTestConfig {
            buffer_size: SIM_TEST_BUFFER_SIZE,
            sweeps: Vec::new(),
            ..MmTestConfig::default()
        }
    }
}

#[derive(Debug)]
pub struct StepReport {
    pub name: String,
    pub outcome: Result<Vec<Measurement>, DmaError>,
}

#[derive(Debug, Default)]
pub struct MmTestReport {
    pub steps: Vec<StepReport>,
}

impl MmTestReport {
    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_err()).count()
    }

    pub fn is_ok(&self) -> bool {
        self.failures() == 0
    }

    fn record(&mut self, name: impl Into<String>, outcome: Result<Vec<Measurement>, DmaError>) {
        let name = name.into();
        match &outcome {
            Ok(measurements) => {
                for m in measurements {
                    info!("{name}: {m}");
                }
            }
            Err(e) => error!("{name} failed: {e}"),
        }
        self.steps.push(StepReport { name, outcome });
    }
}

fn timed_start(ch: &mut DmaChannel, transfer: &Transfer) -> Result<Duration, DmaError> {
    let start = Instant::now();
    ch.start_transfer(transfer)?;
    Ok(start.elapsed())
}

fn destroy(ch: &mut DmaChannel, transfer: Transfer) -> Result<(), DmaError> {
    ch.destroy_transfer(transfer).map_err(|(_, e)| e)
}

/// Fill `buf`, write it to `device_addr`, read it back over a cleared buffer and verify.
///
/// # Returns: `Result<Vec<Measurement>, DmaError>`
/// * `Ok(Vec<Measurement>)` - Host to FPGA and FPGA to host bandwidth
/// * `Err(DmaError::Mismatch)` - The data read back differs
/// * `Err(DmaError)` - A transfer failed
pub fn round_trip(
    ch: &mut DmaChannel,
    buf: &mut AlignedBuffer,
    device_addr: u64,
) -> Result<Vec<Measurement>, DmaError> {
    let len = buf.len() as u64;
    verify::fill(buf.as_mut_slice())?;

    let mut transfer = ch.init_transfer();
    transfer
        .set_src(buf.addr())
        .set_dst(device_addr)
        .set_len(len)
        .set_type(TransferType::HostToFpga);
    let to_device = timed_start(ch, &transfer)?;
    verify::clear(buf.as_mut_slice());

    transfer
        .set_src(device_addr)
        .set_dst(buf.addr())
        .set_type(TransferType::FpgaToHost);
    let from_device = timed_start(ch, &transfer)?;
    verify::verify(buf.as_slice())?;
    destroy(ch, transfer)?;

    Ok(vec![
        Measurement::new(format!("H->F size {len:#x}"), BandwidthReport::new(len, to_device)),
        Measurement::new(format!("F->H size {len:#x}"), BandwidthReport::new(len, from_device)),
    ])
}

/// Copy `buf.len()` bytes from device address `src` to `dst`, read `dst` back into the
/// cleared `buf` and verify it. `src` must already hold the pattern.
pub fn device_copy(
    ch: &mut DmaChannel,
    buf: &mut AlignedBuffer,
    src: u64,
    dst: u64,
) -> Result<Vec<Measurement>, DmaError> {
    let len = buf.len() as u64;
    verify::clear(buf.as_mut_slice());

    let mut transfer = ch.init_transfer();
    transfer
        .set_src(src)
        .set_dst(dst)
        .set_len(len)
        .set_type(TransferType::FpgaToFpga);
    let copy = timed_start(ch, &transfer)?;

    transfer
        .set_src(dst)
        .set_dst(buf.addr())
        .set_type(TransferType::FpgaToHost);
    let from_device = timed_start(ch, &transfer)?;
    verify::verify(buf.as_slice())?;
    destroy(ch, transfer)?;

    Ok(vec![
        Measurement::new(format!("F->F size {len:#x}"), BandwidthReport::new(len, copy)),
        Measurement::new(format!("F->H size {len:#x}"), BandwidthReport::new(len, from_device)),
    ])
}

fn scratch_mut(transfer: &mut Transfer) -> Result<&mut [u8], DmaError> {
    transfer
        .scratch_mut()
        .ok_or_else(|| DmaError::Busy("scratch buffer is unavailable".to_string()))
}

fn scratch(transfer: &Transfer) -> Result<&[u8], DmaError> {
    transfer
        .scratch()
        .ok_or_else(|| DmaError::Busy("scratch buffer is unavailable".to_string()))
}

/// Move an unaligned window of the scratch buffer to the device and back to a different
/// offset of the scratch buffer.
pub fn small_transfer_check(
    ch: &mut DmaChannel,
    transfer: &mut Transfer,
    device_addr: u64,
) -> Result<Vec<Measurement>, DmaError> {
    let base = transfer
        .scratch_addr()
        .ok_or_else(|| DmaError::InvalidParam("not a small transfer".to_string()))?;
    let scratch_len = transfer.scratch_len().unwrap_or_default();
    if scratch_len < 2048 + SMALL_CHECK_LEN {
        return Err(DmaError::InvalidParam(format!(
            "scratch buffer of {scratch_len:#x} bytes is too small for the check"
        )));
    }
    verify::fill(&mut scratch_mut(transfer)?[2048..2048 + SMALL_CHECK_LEN])?;

    transfer
        .set_src(base + 2048)
        .set_dst(device_addr)
        .set_len(SMALL_CHECK_LEN as u64)
        .set_type(TransferType::HostToFpga)
        .set_callback(None);
    let to_device = timed_start(ch, transfer)?;
    verify::clear(scratch_mut(transfer)?);

    transfer
        .set_src(device_addr)
        .set_dst(base + 1024)
        .set_type(TransferType::FpgaToHost);
    let from_device = timed_start(ch, transfer)?;
    verify::verify(&scratch(transfer)?[1024..1024 + SMALL_CHECK_LEN])?;

    let len = SMALL_CHECK_LEN as u64;
    Ok(vec![
        Measurement::new(format!("H->F size {len:#x}"), BandwidthReport::new(len, to_device)),
        Measurement::new(format!("F->H size {len:#x}"), BandwidthReport::new(len, from_device)),
    ])
}

/// Cover the scratch buffer of `transfer` in chunks, `iterations` times.
///
/// Asynchronous loops count completions through a callback and wait for the channel to
/// drain at the end of every iteration. The transfer is left synchronous afterwards.
///
/// # Returns: `Result<SmallLoopReport, DmaError>`
/// * `Ok(SmallLoopReport)` - Counts and bandwidth of the loop
/// * `Err(DmaError::InvalidParam)` - Not a small transfer, a bad chunk size or a device-to-device loop
/// * `Err(DmaError)` - A start or the wait failed
pub fn small_loop(
    ch: &mut DmaChannel,
    transfer: &mut Transfer,
    spec: &SmallLoop,
) -> Result<SmallLoopReport, DmaError> {
    let base = transfer
        .scratch_addr()
        .ok_or_else(|| DmaError::InvalidParam("not a small transfer".to_string()))?;
    let scratch_len = transfer.scratch_len().unwrap_or_default();
    if spec.chunk == 0 || spec.chunk > scratch_len {
        return Err(DmaError::InvalidParam(format!(
            "chunk of {:#x} bytes does not fit a {scratch_len:#x} byte scratch buffer",
            spec.chunk
        )));
    }
    if spec.kind == TransferType::FpgaToFpga {
        return Err(DmaError::InvalidParam(
            "small loops move data between host and device".to_string(),
        ));
    }
    let per_iteration = (scratch_len / spec.chunk) as u64;

    let completed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let callback: Option<TransferCallback> = if spec.asynchronous {
        let (completed, failed) = (completed.clone(), failed.clone());
        Some(Arc::new(move |outcome| {
            let counter = match outcome {
                TransferOutcome::Completed => &completed,
                TransferOutcome::Failed(_) => &failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }))
    } else {
        None
    };
    transfer
        .set_len(spec.chunk as u64)
        .set_type(spec.kind)
        .set_callback(callback);

    let result = run_chunks(ch, transfer, spec, base, per_iteration);
    transfer.set_callback(None);
    let (total, send_only) = result?;

    let transfers = per_iteration * spec.iterations as u64;
    let bytes = transfers * spec.chunk as u64;
    Ok(SmallLoopReport {
        transfers,
        completions: completed.load(Ordering::Acquire),
        failures: failed.load(Ordering::Acquire),
        total: BandwidthReport::new(bytes, total),
        send_only: spec
            .asynchronous
            .then(|| BandwidthReport::new(bytes, send_only)),
    })
}

fn run_chunks(
    ch: &mut DmaChannel,
    transfer: &mut Transfer,
    spec: &SmallLoop,
    base: u64,
    per_iteration: u64,
) -> Result<(Duration, Duration), DmaError> {
    let chunk = spec.chunk as u64;
    let mut total = Duration::ZERO;
    let mut send_only = Duration::ZERO;
    for _ in 0..spec.iterations {
        let start = Instant::now();
        for i in 0..per_iteration {
            let host = base + i * chunk;
            let device = spec.device_addr + i * chunk;
            match spec.kind {
                TransferType::HostToFpga => transfer.set_src(host).set_dst(device),
                _ => transfer.set_src(device).set_dst(host),
            };
            ch.start_transfer(transfer)?;
        }
        send_only += start.elapsed();
        if spec.asynchronous {
            ch.wait_for_count(0, spec.timeout)?;
        }
        total += start.elapsed();
    }
    Ok((total, send_only))
}

/// Run a pair of loops: fill the scratch buffer, write it to the device, clear it, read
/// it back and verify.
fn small_loop_pair(
    ch: &mut DmaChannel,
    transfer: &mut Transfer,
    chunk: usize,
    device_addr: u64,
    asynchronous: bool,
    config: &MmTestConfig,
) -> Result<Vec<Measurement>, DmaError> {
    let mode = if asynchronous { "asynchronous" } else { "synchronous" };
    let mut spec = SmallLoop {
        kind: TransferType::HostToFpga,
        chunk,
        device_addr,
        iterations: config.small_iterations,
        asynchronous,
        timeout: config.wait_timeout,
    };
    verify::fill(scratch_mut(transfer)?)?;
    let to_device = small_loop(ch, transfer, &spec)?;
    check_loop(ch, &to_device, asynchronous)?;
    verify::clear(scratch_mut(transfer)?);

    spec.kind = TransferType::FpgaToHost;
    let from_device = small_loop(ch, transfer, &spec)?;
    check_loop(ch, &from_device, asynchronous)?;
    verify::verify(scratch(transfer)?)?;

    let per_iteration = to_device.transfers / config.small_iterations.max(1) as u64;
    let mut measurements = vec![Measurement::new(
        format!("Small transfers Host to FPGA - {per_iteration} {chunk}-byte {mode} transfers"),
        to_device.total,
    )];
    if let Some(send_only) = to_device.send_only {
        measurements.push(Measurement::new("Send-only", send_only));
    }
    measurements.push(Measurement::new(
        format!("Small transfers FPGA to Host - {per_iteration} {chunk}-byte {mode} transfers"),
        from_device.total,
    ));
    Ok(measurements)
}

fn check_loop(
    ch: &DmaChannel,
    report: &SmallLoopReport,
    asynchronous: bool,
) -> Result<(), DmaError> {
    if report.failures > 0 || (asynchronous && report.completions != report.transfers) {
        return Err(DmaError::Exception {
            channel: ch.index(),
            status: ch.status()?.bits(),
        });
    }
    Ok(())
}

/// Time `iterations` synchronous writes and reads of one sweep buffer, then verify it.
///
/// # Returns: `Result<SweepReport, DmaError>`
/// * `Ok(SweepReport)` - Bandwidth in both directions
/// * `Err(DmaError::InvalidParam)` - The alignment offsets leave nothing to transfer
/// * `Err(DmaError::Mismatch)` - The data read back differs
pub fn ddr_sweep(
    ch: &mut DmaChannel,
    sweep: &Sweep,
    iterations: u32,
    device_base: u64,
) -> Result<SweepReport, DmaError> {
    if sweep.is_empty() {
        return Err(DmaError::InvalidParam(format!(
            "sweep {sweep:?} leaves no bytes to transfer"
        )));
    }
    let len = sweep.len();
    let mut buf = AlignedBuffer::allocate(sweep.size)?;
    let host = buf.addr() + sweep.ptr_align as u64;
    let dst = device_base + sweep.dst;
    info!(
        "Buffer pointer = {host:#x}, size = {len:#x} ({host:#x} through {:#x})",
        host + len as u64
    );
    let window = sweep.ptr_align..sweep.ptr_align + len;
    verify::fill(&mut buf.as_mut_slice()[window.clone()])?;

    let mut transfer = ch.init_transfer();
    transfer
        .set_src(host)
        .set_dst(dst)
        .set_len(len as u64)
        .set_type(TransferType::HostToFpga);
    info!("DDR Sweep Host to FPGA, {iterations} iterations of size {len}");
    let mut to_device = Duration::ZERO;
    for _ in 0..iterations {
        to_device += timed_start(ch, &transfer)?;
    }

    verify::clear(&mut buf.as_mut_slice()[window.clone()]);
    transfer
        .set_src(dst)
        .set_dst(host)
        .set_type(TransferType::FpgaToHost);
    info!("DDR Sweep FPGA to Host, {iterations} iterations of size {len}");
    let mut from_device = Duration::ZERO;
    for _ in 0..iterations {
        from_device += timed_start(ch, &transfer)?;
    }
    verify::verify(&buf.as_slice()[window])?;
    destroy(ch, transfer)?;
    buf.free()?;

    let bytes = len as u64 * iterations as u64;
    Ok(SweepReport {
        to_device: BandwidthReport::new(bytes, to_device),
        from_device: BandwidthReport::new(bytes, from_device),
    })
}

/// Run the whole memory-mapped test sequence on `ch`.
///
/// # Arguments
///
/// * `ch` - An open channel
/// * `config` - Buffer sizes, iteration counts, sweeps and the device address base
///
/// # Returns: `Result<MmTestReport, DmaError>`
/// * `Ok(MmTestReport)` - One entry per step; failed steps carry their error
/// * `Err(DmaError)` - The test buffer could not be allocated
pub fn run_mm_test(ch: &mut DmaChannel, config: &MmTestConfig) -> Result<MmTestReport, DmaError> {
    let mut report = MmTestReport::default();
    let base = config.device_base;
    let mut buf = AlignedBuffer::allocate(config.buffer_size)?;
    info!(
        "Channel {}: memory-mapped test with a {:#x} byte buffer",
        ch.index(),
        config.buffer_size
    );

    let outcome = round_trip(ch, &mut buf, base);
    let copied = outcome.is_ok();
    report.record("round trip", outcome);
    if copied {
        let outcome = device_copy(ch, &mut buf, base, base + config.buffer_size as u64);
        report.record("device copy", outcome);
    }
    buf.free()?;

    info!("Starting small buffer test");
    match ch.init_small_transfer(config.small_buffer_size) {
        Ok(mut small) => {
            let outcome = small_transfer_check(ch, &mut small, base + SMALL_DEVICE_ADDR);
            report.record("small transfer", outcome);
            for asynchronous in [true, false] {
                let mode = if asynchronous { "asynchronous" } else { "synchronous" };
                let outcome = small_loop_pair(
                    ch,
                    &mut small,
                    SMALL_CHUNK,
                    base + SMALL_DEVICE_ADDR,
                    asynchronous,
                    config,
                );
                report.record(format!("{mode} small transfers of {SMALL_CHUNK:#x}"), outcome);
                let chunk = config.small_buffer_size / 2;
                let outcome =
                    small_loop_pair(ch, &mut small, chunk, base, asynchronous, config);
                report.record(format!("{mode} small transfers of {chunk:#x}"), outcome);
            }
            let outcome = ch
                .wait_for_count(0, config.wait_timeout)
                .and_then(|_| destroy(ch, small))
                .map(|_| Vec::new());
            report.record("destroy small transfer", outcome);
        }
        Err(e) => report.record("small transfer setup", Err(e)),
    }

    if !config.sweeps.is_empty() {
        info!("Running DDR sweep test");
    }
    for sweep in &config.sweeps {
        let outcome = ddr_sweep(ch, sweep, config.sweep_iterations, base).map(|r| {
            vec![
                Measurement::new("DDR Sweep Host to FPGA", r.to_device),
                Measurement::new("DDR Sweep FPGA to Host", r.from_device),
            ]
        });
        report.record(
            format!(
                "DDR sweep of {:#x} (pointer +{}, size -{})",
                sweep.size, sweep.ptr_align, sweep.size_align
            ),
            outcome,
        );
    }
    Ok(report)
}
