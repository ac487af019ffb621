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

use log::error;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DmaError {
    #[error("DmaError::InvalidParam: {0}")]
    InvalidParam(String),
    #[error("DmaError::NoMemory: {0}")]
    NoMemory(String),
    #[error("DmaError::Busy: {0}")]
    Busy(String),
    #[error("DmaError::Timeout: {0}")]
    Timeout(String),
    #[error("DmaError::NotSupported: {0}")]
    NotSupported(String),
    #[error("DmaError::NoSuchChannel: channel {index} requested but only {available} available")]
    NoSuchChannel { index: usize, available: usize },
    #[error("DmaError::Exception: channel {channel} stopped on error, status {status:#x}")]
    Exception { channel: usize, status: u32 },
    #[error(
        "DmaError::Mismatch: invalid data at {offset:#x} expected = {expected:#x} actual = {actual:#x}"
    )]
    Mismatch {
        offset: usize,
        expected: u8,
        actual: u8,
    },
    #[error("DmaError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("DmaError::IOReadDir: An IO error occurred when reading directory {dir:?}: {e}")]
    IOReadDir { dir: PathBuf, e: std::io::Error },
    #[error("DmaError::Mmap: Failed to {what}: {e}")]
    Mmap { what: String, e: nix::Error },
    #[error("DmaError::Ioctl: {request} on {file:?} failed: {e}")]
    Ioctl {
        request: &'static str,
        file: PathBuf,
        e: nix::Error,
    },
    #[error("DmaError::TomlDe: Failed to parse config in {file:?}: {e}")]
    TomlDe { file: PathBuf, e: toml::de::Error },
    #[error("DmaError::Internal: An Internal error occurred: {0}")]
    Internal(String),
}

/// Result codes surfaced to callers that only care about the failure class, e.g. the
/// outcome handed to completion callbacks and the bench's per-operation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpgaResult {
    Ok,
    InvalidParam,
    NoMemory,
    Exception,
    Busy,
    Timeout,
    NotSupported,
    NotFound,
}

impl fmt::Display for FpgaResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FpgaResult::Ok => "success",
            FpgaResult::InvalidParam => "invalid parameter",
            FpgaResult::NoMemory => "out of memory",
            FpgaResult::Exception => "exception",
            FpgaResult::Busy => "resource busy",
            FpgaResult::Timeout => "timeout",
            FpgaResult::NotSupported => "not supported",
            FpgaResult::NotFound => "not found",
        };
        f.write_str(s)
    }
}

impl DmaError {
    /// The result code for this error without logging it.
    pub fn code(&self) -> FpgaResult {
        match self {
            DmaError::InvalidParam(..) => FpgaResult::InvalidParam,
            DmaError::NoMemory(..) => FpgaResult::NoMemory,
            DmaError::Mmap { .. } => FpgaResult::NoMemory,
            DmaError::Busy(..) => FpgaResult::Busy,
            DmaError::Timeout(..) => FpgaResult::Timeout,
            DmaError::NotSupported(..) => FpgaResult::NotSupported,
            DmaError::NoSuchChannel { .. } => FpgaResult::NotFound,
            DmaError::IORead { .. } => FpgaResult::NotFound,
            DmaError::IOReadDir { .. } => FpgaResult::NotFound,
            _ => FpgaResult::Exception,
        }
    }
}

impl From<DmaError> for FpgaResult {
    fn from(err: DmaError) -> Self {
        error!("{err}");
        err.code()
    }
}
