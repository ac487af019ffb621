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

//! Error Wrapping File System I/O Helpers
//!
//! Thin wrappers around the standard library file operations the engine needs: reading
//! config files, listing device nodes and opening a port device for register and DMA
//! access. Every helper logs at trace level and converts failures to [`DmaError`]
//! variants that carry the offending path.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use fpga_dma::system_io::{fs_read, fs_read_dir};
//! # use std::path::Path;
//!
//! # fn example() -> Result<(), fpga_dma::error::DmaError> {
//! let config = fs_read(Path::new("/etc/fpga-dma/config.toml"))?;
//! let nodes = fs_read_dir(Path::new("/dev"))?;
//! # Ok(())
//! # }
//! ```

use crate::error::DmaError;
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

/// Read the contents of a file to a String.
///
/// # Arguments
///
/// * `file_path` - Path to the file to read
///
/// # Returns: `Result<String, DmaError>`
/// * `Ok(String)` - The complete contents of the file
/// * `Err(DmaError::IORead)` - If the file cannot be read (doesn't exist, permissions, etc.)
pub fn fs_read(file_path: &Path) -> Result<String, DmaError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf: String = String::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_string(&mut buf));

    match result {
        Ok(_) => {
            trace!("Reading done");
            Ok(buf)
        }
        Err(e) => Err(DmaError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// List the entry names (not full paths) of a directory.
///
/// Entries that cannot be read are silently skipped.
///
/// # Returns: `Result<Vec<String>, DmaError>`
/// * `Ok(Vec<String>)` - Entry names in the directory
/// * `Err(DmaError::IOReadDir)` - If the directory cannot be read
pub fn fs_read_dir(dir: &Path) -> Result<Vec<String>, DmaError> {
    trace!("Attempting to read directory '{dir:?}'");
    std::fs::read_dir(dir).map_or_else(
        |e| {
            Err(DmaError::IOReadDir {
                dir: dir.to_owned(),
                e,
            })
        },
        |iter| {
            let ret = iter
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect();
            trace!("Dir reading done.");
            Ok(ret)
        },
    )
}

/// Open a device node or file for read and write access, as needed to map its register
/// space and issue ioctls on it.
///
/// # Returns: `Result<File, DmaError>`
/// * `Ok(File)` - The opened file
/// * `Err(DmaError::IORead)` - If the file cannot be opened
pub fn fs_open_rw(file_path: &Path) -> Result<File, DmaError> {
    trace!("Attempting to open {file_path:?} for read/write");
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(file_path)
        .map_err(|e| DmaError::IORead {
            file: file_path.into(),
            e,
        })
}
