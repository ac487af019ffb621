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

//! Engine configuration.
//!
//! Hardware granularity constants live here next to the tunable policy: the polling
//! budget and backoff, queue depth, and bounce/scratch buffer sizing. Tunables are read
//! from TOML once, on first use, with the user file overriding the vendor file and the
//! vendor file overriding the hard-coded defaults below. A missing or broken file is not
//! an error; it is logged and the defaults are used.

pub mod config_files;

use crate::config::config_files::{TomlConfig, config_from_file};
use crate::error::DmaError;
use log::{trace, warn};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

/// Every DMA descriptor address and length must be a multiple of one line.
pub const ALIGN_BYTES: u64 = 64;
/// Four lines: the widest burst a descriptor may request.
pub const BURST_BYTES: u64 = 4 * ALIGN_BYTES;
/// Set on descriptor addresses that refer to host memory rather than device memory.
pub const HOST_MASK: u64 = 0x2_0000_0000_0000;

pub static VENDOR_CONFIG_PATH: &str = "/usr/lib/fpga-dma/config.toml";
pub static USER_CONFIG_PATH: &str = "/etc/fpga-dma/config.toml";

// These are hardcoded backups used when no config file provides a value
pub const DEFAULT_MAX_POLLS: u64 = 1_000_000;
pub const DEFAULT_YIELD_AFTER: u32 = 64;
pub const DEFAULT_SLEEP_AFTER: u64 = 10_000;
pub const DEFAULT_SLEEP_MICROS: u64 = 10;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;
pub const DEFAULT_BOUNCE_BUFFERS: usize = 8;
pub const DEFAULT_BOUNCE_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_SMALL_BUFFERS: usize = 4;
pub const DEFAULT_SMALL_BUFFER_MAX_SIZE: usize = 2 * 1024 * 1024;

/// How long and how politely to wait on the hardware.
///
/// A wait reads the status registers up to `max_polls` times. The first `yield_after`
/// unsuccessful reads spin, then the thread yields between reads, and after
/// `sleep_after` reads it sleeps for `sleep` between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_polls: u64,
    pub yield_after: u32,
    pub sleep_after: u64,
    pub sleep: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            max_polls: DEFAULT_MAX_POLLS,
            yield_after: DEFAULT_YIELD_AFTER,
            sleep_after: DEFAULT_SLEEP_AFTER,
            sleep: Duration::from_micros(DEFAULT_SLEEP_MICROS),
        }
    }
}

/// Per-channel resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Transfers that may be outstanding before `start_transfer` retires older ones.
    pub max_in_flight: usize,
    /// Pinned staging buffers used by full (non fast-path) host transfers.
    pub bounce_buffers: usize,
    pub bounce_buffer_size: usize,
    /// Live scratch buffers a channel hands out through `init_small_transfer`.
    pub max_small_buffers: usize,
    pub small_buffer_max_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            bounce_buffers: DEFAULT_BOUNCE_BUFFERS,
            bounce_buffer_size: DEFAULT_BOUNCE_BUFFER_SIZE,
            max_small_buffers: DEFAULT_MAX_SMALL_BUFFERS,
            small_buffer_max_size: DEFAULT_SMALL_BUFFER_MAX_SIZE,
        }
    }
}

impl ChannelConfig {
    /// Reject limits the channel cannot operate with.
    pub fn validate(&self) -> Result<(), DmaError> {
        if self.max_in_flight == 0 {
            return Err(DmaError::InvalidParam(
                "max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.bounce_buffers == 0 {
            return Err(DmaError::InvalidParam(
                "at least one bounce buffer is required".to_string(),
            ));
        }
        if self.bounce_buffer_size == 0
            || self.bounce_buffer_size as u64 % BURST_BYTES != 0
            || self.bounce_buffer_size as u64 > u32::MAX as u64
        {
            return Err(DmaError::InvalidParam(format!(
                "bounce_buffer_size {:#x} must be a non-zero multiple of {BURST_BYTES}",
                self.bounce_buffer_size
            )));
        }
        if self.small_buffer_max_size == 0 {
            return Err(DmaError::InvalidParam(
                "small_buffer_max_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineConfig {
    pub polling: PollPolicy,
    pub channel: ChannelConfig,
}

static CONFIG: OnceLock<Mutex<EngineConfig>> = OnceLock::new();

/// User config overrides vendor config and vendor config overrides hardcoded defaults
fn init_engine_config() -> Mutex<EngineConfig> {
    let vendor_config = config_from_file(Path::new(VENDOR_CONFIG_PATH)).unwrap_or_else(|e| {
        warn!("Using hardcoded values for vendor config because loading config failed: {e}");
        TomlConfig::default()
    });
    let user_config = config_from_file(Path::new(USER_CONFIG_PATH)).unwrap_or_else(|e| {
        warn!("Using hardcoded values for user config because loading config failed: {e}");
        TomlConfig::default()
    });
    trace!("Merging user_config: {user_config:?} with vendor_config {vendor_config:?}");
    let merged: EngineConfig = user_config.merge(vendor_config).into();
    let merged = match merged.channel.validate() {
        Ok(()) => merged,
        Err(e) => {
            warn!("Ignoring [channel] settings from config files: {e}");
            EngineConfig {
                polling: merged.polling,
                channel: ChannelConfig::default(),
            }
        }
    };
    trace!("Resulting config: {merged:?}");
    Mutex::new(merged)
}

fn engine_config_guard() -> Result<MutexGuard<'static, EngineConfig>, DmaError> {
    CONFIG
        .get_or_init(init_engine_config)
        .lock()
        .map_err(|e| DmaError::Internal(format!("Failed when locking engine config: {e}")))
}

/// Snapshot of the process-wide configuration. Channels copy it when they are opened.
pub fn engine_config() -> Result<EngineConfig, DmaError> {
    Ok(*engine_config_guard()?)
}

pub fn set_poll_policy(policy: PollPolicy) -> Result<(), DmaError> {
    if policy.max_polls == 0 {
        return Err(DmaError::InvalidParam(
            "max_polls must be at least 1".to_string(),
        ));
    }
    engine_config_guard()?.polling = policy;
    Ok(())
}

pub fn set_channel_config(channel: ChannelConfig) -> Result<(), DmaError> {
    channel.validate()?;
    engine_config_guard()?.channel = channel;
    Ok(())
}
