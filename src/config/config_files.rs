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

use crate::config::{
    ChannelConfig, DEFAULT_BOUNCE_BUFFER_SIZE, DEFAULT_BOUNCE_BUFFERS, DEFAULT_MAX_IN_FLIGHT,
    DEFAULT_MAX_POLLS, DEFAULT_MAX_SMALL_BUFFERS, DEFAULT_SLEEP_AFTER, DEFAULT_SLEEP_MICROS,
    DEFAULT_SMALL_BUFFER_MAX_SIZE, DEFAULT_YIELD_AFTER, EngineConfig, PollPolicy,
};
use crate::error::DmaError;
use crate::system_io::fs_read;
use log::trace;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// This is the top level struct which holds all sections
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TomlConfig {
    polling: Option<PollingToml>,
    channel: Option<ChannelToml>,
}

/// This is the "polling" section struct
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PollingToml {
    max_polls: Option<u64>,
    yield_after: Option<u32>,
    sleep_after: Option<u64>,
    sleep_micros: Option<u64>,
}

/// This is the "channel" section struct
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChannelToml {
    max_in_flight: Option<usize>,
    bounce_buffers: Option<usize>,
    bounce_buffer_size: Option<usize>,
    max_small_buffers: Option<usize>,
    small_buffer_max_size: Option<usize>,
}

impl PollingToml {
    fn merge(self, fallback: PollingToml) -> PollingToml {
        PollingToml {
            max_polls: self.max_polls.or(fallback.max_polls),
            yield_after: self.yield_after.or(fallback.yield_after),
            sleep_after: self.sleep_after.or(fallback.sleep_after),
            sleep_micros: self.sleep_micros.or(fallback.sleep_micros),
        }
    }
}

impl ChannelToml {
    fn merge(self, fallback: ChannelToml) -> ChannelToml {
        ChannelToml {
            max_in_flight: self.max_in_flight.or(fallback.max_in_flight),
            bounce_buffers: self.bounce_buffers.or(fallback.bounce_buffers),
            bounce_buffer_size: self.bounce_buffer_size.or(fallback.bounce_buffer_size),
            max_small_buffers: self.max_small_buffers.or(fallback.max_small_buffers),
            small_buffer_max_size: self
                .small_buffer_max_size
                .or(fallback.small_buffer_max_size),
        }
    }
}

impl TomlConfig {
    pub(crate) fn merge(self, fallback: TomlConfig) -> TomlConfig {
        let polling = match (self.polling, fallback.polling) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        };
        let channel = match (self.channel, fallback.channel) {
            (Some(a), Some(b)) => Some(a.merge(b)),
            (a, b) => a.or(b),
        };
        TomlConfig { polling, channel }
    }
}

impl From<PollingToml> for PollPolicy {
    fn from(value: PollingToml) -> Self {
        let max_polls = match value.max_polls {
            Some(0) | None => {
                trace!("No usable max_polls provided. Using hardcoded value.");
                DEFAULT_MAX_POLLS
            }
            Some(n) => n,
        };
        PollPolicy {
            max_polls,
            yield_after: value.yield_after.unwrap_or_else(|| {
                trace!("No yield_after provided. Using hardcoded value.");
                DEFAULT_YIELD_AFTER
            }),
            sleep_after: value.sleep_after.unwrap_or_else(|| {
                trace!("No sleep_after provided. Using hardcoded value.");
                DEFAULT_SLEEP_AFTER
            }),
            sleep: Duration::from_micros(value.sleep_micros.unwrap_or_else(|| {
                trace!("No sleep_micros provided. Using hardcoded value.");
                DEFAULT_SLEEP_MICROS
            })),
        }
    }
}

impl From<ChannelToml> for ChannelConfig {
    fn from(value: ChannelToml) -> Self {
        ChannelConfig {
            max_in_flight: value.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT),
            bounce_buffers: value.bounce_buffers.unwrap_or(DEFAULT_BOUNCE_BUFFERS),
            bounce_buffer_size: value
                .bounce_buffer_size
                .unwrap_or(DEFAULT_BOUNCE_BUFFER_SIZE),
            max_small_buffers: value.max_small_buffers.unwrap_or(DEFAULT_MAX_SMALL_BUFFERS),
            small_buffer_max_size: value
                .small_buffer_max_size
                .unwrap_or(DEFAULT_SMALL_BUFFER_MAX_SIZE),
        }
    }
}

impl From<TomlConfig> for EngineConfig {
    fn from(value: TomlConfig) -> Self {
        trace!("Creating EngineConfig from {value:?}");
        EngineConfig {
            polling: value.polling.unwrap_or_default().into(),
            channel: value.channel.unwrap_or_default().into(),
        }
    }
}

fn toml_str_to_config(toml_string: &str, file: &Path) -> Result<TomlConfig, DmaError> {
    toml::from_str(toml_string).map_err(|e| DmaError::TomlDe {
        file: file.to_owned(),
        e,
    })
}

pub(crate) fn config_from_file(file_path: &Path) -> Result<TomlConfig, DmaError> {
    if !file_path.is_file() {
        return Err(DmaError::Internal(format!(
            "Config file not found in {file_path:?}"
        )));
    }
    toml_str_to_config(&fs_read(file_path)?, file_path)
}

/// Parse a config document on its own, filling absent keys with the hardcoded defaults.
pub fn parse_config(toml_string: &str) -> Result<EngineConfig, DmaError> {
    let config: EngineConfig =
        toml_str_to_config(toml_string, &PathBuf::from("<inline>"))?.into();
    config.channel.validate()?;
    Ok(config)
}
